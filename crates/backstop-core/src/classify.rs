//! Failure classification.
//!
//! Two views of the same taxonomy:
//!
//! - the primary path classifies an [`ErrorSignal`] into [`ErrorClass`]
//!   (transient, permanent, unknown) and retries unknowns optimistically;
//! - the DLQ worker categorizes a stored error type code into
//!   [`FailureCategory`] (temporary, permanent, manual) and escalates
//!   unknowns to a human, since the message already exhausted its retries.
//!
//! Pattern tables are ordered and the first match wins: transient patterns
//! are checked before permanent ones, so `"invalid response: 503"` is
//! transient.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::models::DlqMessage;

/// Error surfaced by the business-logic executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSignal {
    /// Human-readable message.
    pub message: String,
    /// Error name or class, e.g. `ValidationError`.
    pub name: Option<String>,
    /// Error type code, e.g. `TIMEOUT_ERROR`.
    pub code: Option<String>,
    /// Stack or trace text.
    pub stack: Option<String>,
}

impl ErrorSignal {
    /// Creates a signal with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), name: None, code: None, stack: None }
    }

    /// Sets the error name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the error type code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Sets the stack text.
    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl fmt::Display for ErrorSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ErrorSignal {}

impl From<&str> for ErrorSignal {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for ErrorSignal {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Primary-path classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    /// Likely to succeed on retry.
    Transient,
    /// Will fail again no matter how often it is retried.
    Permanent,
    /// No pattern matched.
    Unknown,
}

impl ErrorClass {
    /// Error type code stored on DLQ records classified this way.
    pub const fn as_error_type(self) -> &'static str {
        match self {
            Self::Transient => "TRANSIENT_ERROR",
            Self::Permanent => "PERMANENT_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    /// Unknown errors are retried on the primary path.
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_error_type())
    }
}

#[derive(Debug, Clone, Copy)]
enum Pattern {
    /// Matches the token exactly as written.
    Exact(&'static str),
    /// Matches the lowercase word regardless of case.
    Word(&'static str),
}

impl Pattern {
    fn matches(self, text: &str, lowered: &str) -> bool {
        match self {
            Self::Exact(token) => text.contains(token),
            Self::Word(word) => lowered.contains(word),
        }
    }
}

const TRANSIENT_PATTERNS: &[Pattern] = &[
    Pattern::Word("timeout"),
    Pattern::Exact("ETIMEDOUT"),
    Pattern::Exact("ECONNREFUSED"),
    Pattern::Exact("ECONNRESET"),
    Pattern::Word("connection refused"),
    Pattern::Word("connection reset"),
    Pattern::Word("rate limit"),
    Pattern::Exact("429"),
    Pattern::Exact("503"),
    Pattern::Word("service unavailable"),
];

const PERMANENT_PATTERNS: &[Pattern] = &[
    Pattern::Word("validation"),
    Pattern::Word("invalid"),
    Pattern::Exact("400"),
    Pattern::Exact("401"),
    Pattern::Exact("403"),
    Pattern::Exact("404"),
    Pattern::Word("not found"),
    Pattern::Word("unauthorized"),
];

fn matches_any(patterns: &[Pattern], text: &str) -> bool {
    let lowered = text.to_lowercase();
    patterns.iter().any(|pattern| pattern.matches(text, &lowered))
}

/// Matches the pattern tables against free text, first match wins.
fn classify_text<'a>(texts: impl IntoIterator<Item = &'a str> + Clone) -> ErrorClass {
    if texts.clone().into_iter().any(|text| matches_any(TRANSIENT_PATTERNS, text)) {
        ErrorClass::Transient
    } else if texts.into_iter().any(|text| matches_any(PERMANENT_PATTERNS, text)) {
        ErrorClass::Permanent
    } else {
        ErrorClass::Unknown
    }
}

/// Classifies an executor error for the primary path.
///
/// Patterns are matched against the message and the name.
pub fn classify(signal: &ErrorSignal) -> ErrorClass {
    let texts = std::iter::once(signal.message.as_str()).chain(signal.name.as_deref());
    classify_text(texts)
}

/// Worker-side failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    /// Worth re-injecting.
    Temporary,
    /// Never going to succeed.
    Permanent,
    /// Needs a human.
    Manual,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temporary => write!(f, "TEMPORARY"),
            Self::Permanent => write!(f, "PERMANENT"),
            Self::Manual => write!(f, "MANUAL"),
        }
    }
}

/// Operator guidance for a failure category.
pub const fn recommended_action(category: FailureCategory) -> &'static str {
    match category {
        FailureCategory::Temporary => "retry automatically with backoff",
        FailureCategory::Permanent => "fix the payload or producer, then replay",
        FailureCategory::Manual => "investigate the failure and replay or resolve",
    }
}

/// Error type codes the worker recognises, per category.
///
/// Codes match by containment against the upper-cased stored error type,
/// checked in the order temporary, permanent, manual. A type matching none
/// of them falls back to the primary-path patterns, and to
/// [`FailureCategory::Manual`] when those do not match either.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationTable {
    /// Codes re-injected automatically.
    pub temporary: Vec<String>,
    /// Codes failed permanently.
    pub permanent: Vec<String>,
    /// Codes escalated to a human.
    pub manual: Vec<String>,
}

impl Default for ClassificationTable {
    fn default() -> Self {
        let codes = |list: &[&str]| list.iter().map(ToString::to_string).collect();
        Self {
            temporary: codes(&[
                "TIMEOUT_ERROR",
                "CONNECTION_ERROR",
                "RATE_LIMIT_ERROR",
                "SERVICE_UNAVAILABLE",
                "NETWORK_ERROR",
                "TEMPORARY_FAILURE",
                "TRANSIENT_ERROR",
            ]),
            permanent: codes(&[
                "VALIDATION_ERROR",
                "AUTHORIZATION_ERROR",
                "NOT_FOUND_ERROR",
                "BUSINESS_LOGIC_ERROR",
                "SCHEMA_ERROR",
                "INVALID_REQUEST",
                "PERMANENT_ERROR",
            ]),
            manual: codes(&["UNKNOWN_ERROR", "UNHANDLED_ERROR"]),
        }
    }
}

impl ClassificationTable {
    /// Categorizes a stored error type. Empty or missing types are manual.
    pub fn categorize(&self, error_type: Option<&str>) -> FailureCategory {
        let Some(error_type) = error_type.map(str::trim).filter(|t| !t.is_empty()) else {
            return FailureCategory::Manual;
        };

        let upper = error_type.to_uppercase();
        let listed = |codes: &[String]| codes.iter().any(|code| upper.contains(code.as_str()));

        if listed(&self.temporary) {
            return FailureCategory::Temporary;
        }
        if listed(&self.permanent) {
            return FailureCategory::Permanent;
        }
        if listed(&self.manual) {
            return FailureCategory::Manual;
        }

        match classify_text([error_type]) {
            ErrorClass::Transient => FailureCategory::Temporary,
            ErrorClass::Permanent => FailureCategory::Permanent,
            ErrorClass::Unknown => FailureCategory::Manual,
        }
    }
}

/// Error counts across a set of dead-lettered messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorStatistics {
    /// Messages examined.
    pub total: usize,
    /// Categorized temporary.
    pub temporary: usize,
    /// Categorized permanent.
    pub permanent: usize,
    /// Categorized manual.
    pub manual: usize,
    /// Count per raw error type.
    pub by_type: BTreeMap<String, usize>,
}

impl ErrorStatistics {
    /// Tallies `messages` using `table`.
    pub fn collect<'a>(
        table: &ClassificationTable,
        messages: impl IntoIterator<Item = &'a DlqMessage>,
    ) -> Self {
        let mut stats = Self::default();
        for message in messages {
            stats.total += 1;
            match table.categorize(Some(&message.error_type)) {
                FailureCategory::Temporary => stats.temporary += 1,
                FailureCategory::Permanent => stats.permanent += 1,
                FailureCategory::Manual => stats.manual += 1,
            }
            *stats.by_type.entry(message.error_type.clone()).or_default() += 1;
        }
        stats
    }
}
