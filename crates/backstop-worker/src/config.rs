//! Worker configuration.

use std::time::Duration;

use backstop_core::{ClassificationTable, RecoveryStrategy, DEFAULT_PRIORITY};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkerError};

/// Settings for the DLQ worker loop and its strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Sleep between iterations.
    pub poll_interval: Duration,

    /// Messages fetched per iteration.
    pub batch_size: usize,

    /// DLQ retries before a message is failed for good.
    pub max_dlq_retries: u32,

    /// Age after which a lock counts as abandoned.
    pub lock_timeout: Duration,

    /// Delay per DLQ retry; indexed by the retry count and clamped to the
    /// last entry.
    pub backoff_schedule: Vec<Duration>,

    /// UTC hour scheduled retries are deferred to.
    pub off_peak_hour: u32,

    /// Sleep after a failed iteration.
    pub recovery_interval: Duration,

    /// Strategy applied to temporary failures.
    pub temporary_strategy: RecoveryStrategy,

    /// Source stamped on replay envelopes when the record has none.
    pub replay_source: String,

    /// Priority stamped on replay envelopes when the record has none.
    pub replay_priority: i32,

    /// Error type codes per category.
    pub classification: ClassificationTable,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 10,
            max_dlq_retries: 5,
            lock_timeout: Duration::from_secs(300),
            backoff_schedule: [1, 5, 15, 30, 60]
                .into_iter()
                .map(|minutes| Duration::from_secs(minutes * 60))
                .collect(),
            off_peak_hour: 2,
            recovery_interval: Duration::from_secs(5),
            temporary_strategy: RecoveryStrategy::ImmediateRetry,
            replay_source: "dlq".to_string(),
            replay_priority: DEFAULT_PRIORITY,
            classification: ClassificationTable::default(),
        }
    }
}

impl WorkerConfig {
    /// Checks the values the loop cannot run with.
    ///
    /// # Errors
    ///
    /// Returns error for a zero batch size, an empty schedule or an
    /// off-peak hour above 23.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(WorkerError::configuration("worker batch size must be positive"));
        }
        if self.backoff_schedule.is_empty() {
            return Err(WorkerError::configuration("worker backoff schedule must not be empty"));
        }
        if self.off_peak_hour > 23 {
            return Err(WorkerError::configuration(format!(
                "off-peak hour must be 0-23, got {}",
                self.off_peak_hour
            )));
        }
        if self.lock_timeout.is_zero() {
            return Err(WorkerError::configuration("lock timeout must be positive"));
        }
        Ok(())
    }
}
