//! Business-logic executor seam.
//!
//! The processor treats the handler as opaque: it only looks at whether it
//! failed and, if so, at the [`ErrorSignal`] it returned.

use std::{fmt, sync::Arc, time::Duration};

use backstop_core::{Clock, ErrorSignal, QueueEnvelope};
use rand::Rng;
use serde_json::{json, Value};

/// Executes business logic for one envelope.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + fmt::Debug {
    /// Processes the envelope, returning a result document or the failure.
    async fn handle(&self, envelope: &QueueEnvelope) -> Result<Value, ErrorSignal>;
}

/// Handler that fails on demand.
///
/// A payload with `"simulateError": true` fails with the canonical message
/// for its `"errorType"` (default `TIMEOUT_ERROR`); anything else succeeds
/// and echoes the payload. Each call takes a random latency within the
/// configured range, slept on the injected clock.
#[derive(Debug, Clone)]
pub struct SimulatedHandler {
    clock: Arc<dyn Clock>,
    min_latency: Duration,
    max_latency: Duration,
}

impl SimulatedHandler {
    /// Creates a handler with 50 to 150 ms of latency.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, min_latency: Duration::from_millis(50), max_latency: Duration::from_millis(150) }
    }

    /// Overrides the latency range.
    #[must_use]
    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.min_latency = min.min(max);
        self.max_latency = max.max(min);
        self
    }

    /// Failure produced for a simulated error type.
    pub fn failure_for(error_type: &str) -> ErrorSignal {
        let (code, message) = match error_type {
            "TIMEOUT_ERROR" => ("TIMEOUT_ERROR", "External API timeout after 5000ms"),
            "VALIDATION_ERROR" => ("VALIDATION_ERROR", "Invalid payload: missing required field"),
            "RATE_LIMIT_ERROR" => ("RATE_LIMIT_ERROR", "Rate limit exceeded: 429 Too Many Requests"),
            "SERVICE_UNAVAILABLE" => ("SERVICE_UNAVAILABLE", "Service unavailable: 503"),
            _ => ("UNKNOWN_ERROR", "Unknown error occurred"),
        };
        ErrorSignal::new(message).with_name("Error").with_code(code)
    }

    fn latency(&self) -> Duration {
        if self.max_latency <= self.min_latency {
            return self.min_latency;
        }
        rand::rng().random_range(self.min_latency..=self.max_latency)
    }
}

#[async_trait::async_trait]
impl MessageHandler for SimulatedHandler {
    async fn handle(&self, envelope: &QueueEnvelope) -> Result<Value, ErrorSignal> {
        self.clock.sleep(self.latency()).await;

        let payload = &envelope.payload;
        if payload.get("simulateError").and_then(Value::as_bool).unwrap_or(false) {
            let error_type =
                payload.get("errorType").and_then(Value::as_str).unwrap_or("TIMEOUT_ERROR");
            return Err(Self::failure_for(error_type));
        }

        Ok(json!({
            "processed": true,
            "timestamp": self.clock.now_utc(),
            "data": payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use backstop_core::{classify, ErrorClass, TestClock};

    use super::*;

    fn handler() -> SimulatedHandler {
        SimulatedHandler::new(Arc::new(TestClock::new()))
            .with_latency(Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn plain_payload_succeeds() {
        let envelope = QueueEnvelope::new("ok", json!({"orderId": 7}));

        let result = handler().handle(&envelope).await.unwrap();

        assert_eq!(result["processed"], json!(true));
        assert_eq!(result["data"]["orderId"], json!(7));
    }

    #[tokio::test]
    async fn simulated_errors_classify_as_expected() {
        let cases = [
            ("TIMEOUT_ERROR", ErrorClass::Transient),
            ("VALIDATION_ERROR", ErrorClass::Permanent),
            ("RATE_LIMIT_ERROR", ErrorClass::Transient),
            ("SERVICE_UNAVAILABLE", ErrorClass::Transient),
            ("SOMETHING_ELSE", ErrorClass::Unknown),
        ];

        for (error_type, expected) in cases {
            let envelope = QueueEnvelope::new(
                error_type,
                json!({"simulateError": true, "errorType": error_type}),
            );
            let err = handler().handle(&envelope).await.unwrap_err();
            assert_eq!(classify(&err), expected, "{error_type}");
        }
    }

    #[tokio::test]
    async fn missing_error_type_defaults_to_timeout() {
        let envelope = QueueEnvelope::new("t", json!({"simulateError": true}));

        let err = handler().handle(&envelope).await.unwrap_err();

        assert_eq!(err.code.as_deref(), Some("TIMEOUT_ERROR"));
        assert_eq!(err.message, "External API timeout after 5000ms");
    }

    #[tokio::test]
    async fn latency_is_slept_on_the_clock() {
        let clock = TestClock::new();
        let handler = SimulatedHandler::new(Arc::new(clock.clone()))
            .with_latency(Duration::from_millis(80), Duration::from_millis(80));

        handler.handle(&QueueEnvelope::new("x", json!({}))).await.unwrap();

        assert_eq!(clock.elapsed(), Duration::from_millis(80));
    }
}
