//! Recovery strategy selection for dead-lettered messages.

use backstop_core::{DlqMessage, FailureCategory, RecoveryStrategy};
use serde::{Deserialize, Serialize};

use crate::config::WorkerConfig;

/// Strategy chosen for one message, with the reasoning behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategySelection {
    /// Category of the stored error type.
    pub category: FailureCategory,
    /// Strategy to execute.
    pub strategy: RecoveryStrategy,
    /// True when the DLQ retry budget decided, not the category.
    pub retries_exhausted: bool,
}

/// Picks the recovery strategy for `message`.
///
/// A spent DLQ retry budget always fails the message. Otherwise temporary
/// errors get the configured temporary strategy, permanent errors are
/// failed, and everything else is escalated to a human.
pub fn select_strategy(message: &DlqMessage, config: &WorkerConfig) -> StrategySelection {
    let category = config.classification.categorize(Some(&message.error_type));
    let spent = u32::try_from(message.dlq_retry_count).unwrap_or(0);

    if spent >= config.max_dlq_retries {
        return StrategySelection {
            category,
            strategy: RecoveryStrategy::MarkAsFailed,
            retries_exhausted: true,
        };
    }

    let strategy = match category {
        FailureCategory::Temporary => config.temporary_strategy,
        FailureCategory::Permanent => RecoveryStrategy::MarkAsFailed,
        FailureCategory::Manual => RecoveryStrategy::ManualIntervention,
    };

    StrategySelection { category, strategy, retries_exhausted: false }
}
