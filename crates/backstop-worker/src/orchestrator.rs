//! DLQ worker polling loop.
//!
//! Every iteration clears abandoned locks, fetches a batch of eligible
//! messages, and takes them one at a time through lock, strategy selection
//! and strategy execution. Several workers, in one process or many, can run
//! against the same store: the conditional lock update decides who handles
//! a message, and the loser simply skips it.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use backstop_core::{
    backoff::{format_duration, to_chrono},
    Clock, DlqMessage, DlqStore, LiveQueue, RecoveryStrategy,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    classifier::{select_strategy, StrategySelection},
    config::WorkerConfig,
    error::{Result, WorkerError},
    strategy::{StrategyExecutor, StrategyOutcome},
};

/// Builds a worker id unique across hosts and restarts:
/// `worker_{hostname}_{pid}_{millis}`.
pub fn generate_worker_id(now: DateTime<Utc>) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("worker_{host}_{}_{}", std::process::id(), now.timestamp_millis())
}

/// What happened to one message of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageResult {
    /// A strategy ran to completion.
    Completed {
        /// Selection that led to it
        selection: StrategySelection,
        /// What the strategy did
        outcome: StrategyOutcome,
    },
    /// Another worker got there first, or the message is no longer due.
    Skipped,
    /// Lock or strategy failed; the lock was released.
    Failed {
        /// Why
        error: String,
    },
}

/// Result of one iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Locks cleared before fetching.
    pub stale_locks_cleared: u64,
    /// Messages fetched.
    pub fetched: usize,
    /// Strategies completed.
    pub successful: usize,
    /// Strategies failed.
    pub failed: usize,
    /// Messages skipped.
    pub skipped: usize,
    /// Per-message results, in batch order.
    pub results: Vec<(String, MessageResult)>,
}

/// Cumulative worker statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Worker identity.
    pub worker_id: String,
    /// True while the loop runs.
    pub is_running: bool,
    /// Messages handled, successful or not. Skipped ones do not count.
    pub total_processed: u64,
    /// Strategies completed.
    pub total_successful: u64,
    /// Strategies failed.
    pub total_failed: u64,
    /// Messages skipped for lock contention.
    pub total_skipped: u64,
    /// Stale locks this worker cleared.
    pub stale_locks_cleared: u64,
    /// Completed iterations.
    pub iterations: u64,
    /// When the loop started.
    pub started_at: Option<DateTime<Utc>>,
    /// Time since the loop started.
    pub uptime: Duration,
    /// `uptime` for humans, e.g. `"2h 5m"`.
    pub uptime_display: String,
    /// Share of processed messages that succeeded; `None` before the first.
    pub success_rate: Option<f64>,
    /// Completed strategies by kind.
    pub by_strategy: HashMap<RecoveryStrategy, u64>,
}

#[derive(Debug, Default)]
struct StatsState {
    is_running: bool,
    total_successful: u64,
    total_failed: u64,
    total_skipped: u64,
    stale_locks_cleared: u64,
    iterations: u64,
    started_at: Option<(Instant, DateTime<Utc>)>,
    by_strategy: HashMap<RecoveryStrategy, u64>,
}

/// Polls the DLQ store and recovers messages.
#[derive(Debug)]
pub struct WorkerOrchestrator {
    worker_id: String,
    config: Arc<WorkerConfig>,
    store: Arc<dyn DlqStore>,
    executor: StrategyExecutor,
    clock: Arc<dyn Clock>,
    stats: RwLock<StatsState>,
}

impl WorkerOrchestrator {
    /// Creates a worker with a generated id.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn DlqStore>,
        queue: Arc<dyn LiveQueue>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let worker_id = generate_worker_id(clock.now_utc());
        Self::with_worker_id(worker_id, config, store, queue, clock)
    }

    /// Creates a worker with an explicit id.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn with_worker_id(
        worker_id: impl Into<String>,
        config: WorkerConfig,
        store: Arc<dyn DlqStore>,
        queue: Arc<dyn LiveQueue>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let worker_id = worker_id.into();
        let config = Arc::new(config);
        let executor = StrategyExecutor::new(
            worker_id.clone(),
            config.clone(),
            store.clone(),
            queue,
            clock.clone(),
        );

        Ok(Self {
            worker_id,
            config,
            store,
            executor,
            clock,
            stats: RwLock::new(StatsState::default()),
        })
    }

    /// Worker identity.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Configuration in use.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Runs one iteration: clear stale locks, fetch a batch, process it.
    ///
    /// A failed stale-lock sweep is logged and the iteration continues.
    ///
    /// # Errors
    ///
    /// Returns error if the batch cannot be fetched.
    pub async fn run_once(&self) -> Result<BatchReport> {
        let mut report = BatchReport {
            stale_locks_cleared: self.clear_stale_locks().await,
            ..BatchReport::default()
        };

        let batch = self.store.find_pending(self.config.batch_size, self.clock.now_utc()).await?;
        report.fetched = batch.len();

        if batch.is_empty() {
            debug!(worker_id = %self.worker_id, "no pending dlq messages");
        } else {
            info!(worker_id = %self.worker_id, count = batch.len(), "found pending dlq messages");
        }

        for message in batch {
            let result = self.process_message(&message).await;
            match &result {
                MessageResult::Completed { .. } => report.successful += 1,
                MessageResult::Skipped => report.skipped += 1,
                MessageResult::Failed { .. } => report.failed += 1,
            }
            report.results.push((message.message_id, result));
        }

        self.stats.write().await.iterations += 1;

        if report.fetched > 0 {
            info!(
                worker_id = %self.worker_id,
                fetched = report.fetched,
                successful = report.successful,
                failed = report.failed,
                skipped = report.skipped,
                "dlq batch processed"
            );
        }
        Ok(report)
    }

    /// Locks, classifies and recovers one message.
    ///
    /// The record is re-read once locked, so a message another worker
    /// rescheduled between fetch and lock is released and skipped.
    pub async fn process_message(&self, message: &DlqMessage) -> MessageResult {
        let started = self.clock.now();
        let now = self.clock.now_utc();

        match self.store.acquire_lock(message.id, &self.worker_id, now).await {
            Ok(true) => {},
            Ok(false) => {
                debug!(message_id = %message.message_id, "dlq message locked elsewhere, skipping");
                self.stats.write().await.total_skipped += 1;
                return MessageResult::Skipped;
            },
            Err(e) => {
                error!(message_id = %message.message_id, error = %e, "failed to acquire lock");
                return self.failed(e.into()).await;
            },
        }

        let current = match self.store.find_by_id(message.id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                return self.failed(WorkerError::not_found(&message.message_id)).await;
            },
            Err(e) => {
                self.release(message).await;
                return self.failed(e.into()).await;
            },
        };
        if current.next_retry_at.is_some_and(|at| at > now) {
            debug!(message_id = %current.message_id, "dlq message no longer due, skipping");
            self.release(&current).await;
            self.stats.write().await.total_skipped += 1;
            return MessageResult::Skipped;
        }

        let selection = select_strategy(&current, &self.config);
        info!(
            message_id = %current.message_id,
            error_type = %current.error_type,
            category = %selection.category,
            strategy = %selection.strategy,
            dlq_retry_count = current.dlq_retry_count,
            "processing dlq message"
        );

        match self.executor.execute(&current, selection.strategy).await {
            Ok(outcome) => {
                {
                    let mut stats = self.stats.write().await;
                    stats.total_successful += 1;
                    *stats.by_strategy.entry(outcome.strategy).or_default() += 1;
                }
                debug!(
                    message_id = %current.message_id,
                    elapsed_ms = self.clock.now().duration_since(started).as_millis(),
                    "dlq message processed"
                );
                MessageResult::Completed { selection, outcome }
            },
            Err(e) => self.failed(e).await,
        }
    }

    /// Runs until `token` is cancelled.
    ///
    /// Cancellation is observed between iterations and while sleeping; a
    /// batch in progress is always finished. An iteration error is logged
    /// and followed by the recovery interval instead of the poll interval.
    ///
    /// # Errors
    ///
    /// Currently never returns error; the loop only ends on cancellation.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        {
            let mut stats = self.stats.write().await;
            stats.is_running = true;
            stats.started_at = Some((self.clock.now(), self.clock.now_utc()));
        }
        info!(
            worker_id = %self.worker_id,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            "dlq worker started"
        );

        loop {
            if token.is_cancelled() {
                break;
            }

            let pause = match self.run_once().await {
                Ok(_) => self.config.poll_interval,
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "dlq worker iteration failed");
                    self.config.recovery_interval
                },
            };

            tokio::select! {
                () = self.clock.sleep(pause) => {}
                () = token.cancelled() => break,
            }
        }

        self.stats.write().await.is_running = false;
        let stats = self.stats().await;
        info!(
            worker_id = %self.worker_id,
            total_processed = stats.total_processed,
            total_successful = stats.total_successful,
            total_failed = stats.total_failed,
            total_skipped = stats.total_skipped,
            uptime = %stats.uptime_display,
            "dlq worker stopped"
        );
        Ok(())
    }

    /// Spawns [`run`](Self::run) on the runtime.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> WorkerHandle {
        let task_token = token.clone();
        let handle = tokio::spawn(async move { self.run(task_token).await });
        WorkerHandle { token, handle }
    }

    /// Statistics snapshot.
    pub async fn stats(&self) -> WorkerStats {
        let state = self.stats.read().await;
        let total_processed = state.total_successful + state.total_failed;
        let uptime = state
            .started_at
            .map_or(Duration::ZERO, |(started, _)| self.clock.now().duration_since(started));
        let success_rate = (total_processed > 0)
            .then(|| state.total_successful as f64 / total_processed as f64);

        WorkerStats {
            worker_id: self.worker_id.clone(),
            is_running: state.is_running,
            total_processed,
            total_successful: state.total_successful,
            total_failed: state.total_failed,
            total_skipped: state.total_skipped,
            stale_locks_cleared: state.stale_locks_cleared,
            iterations: state.iterations,
            started_at: state.started_at.map(|(_, at)| at),
            uptime,
            uptime_display: format_duration(uptime),
            success_rate,
            by_strategy: state.by_strategy.clone(),
        }
    }

    async fn clear_stale_locks(&self) -> u64 {
        let now = self.clock.now_utc();
        let cutoff = now - to_chrono(self.config.lock_timeout);

        match self.store.clear_stale_locks(cutoff, now).await {
            Ok(0) => 0,
            Ok(cleared) => {
                info!(
                    worker_id = %self.worker_id,
                    count = cleared,
                    lock_timeout_ms = self.config.lock_timeout.as_millis(),
                    "cleared stale locks"
                );
                self.stats.write().await.stale_locks_cleared += cleared;
                cleared
            },
            Err(e) => {
                error!(worker_id = %self.worker_id, error = %e, "failed to clear stale locks");
                0
            },
        }
    }

    async fn release(&self, message: &DlqMessage) {
        if let Err(e) =
            self.store.release_lock(message.id, &self.worker_id, self.clock.now_utc()).await
        {
            error!(message_id = %message.message_id, error = %e, "failed to release lock");
        }
    }

    async fn failed(&self, error: WorkerError) -> MessageResult {
        self.stats.write().await.total_failed += 1;
        MessageResult::Failed { error: error.to_string() }
    }
}

/// Handle to a spawned worker loop.
#[derive(Debug)]
pub struct WorkerHandle {
    token: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    /// Returns true while the loop runs.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancels the loop and waits for the current batch to finish, up to
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// Returns error if the loop does not stop in time or panicked.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.token.cancel();
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!(error = %e, "dlq worker task panicked");
                Err(WorkerError::WorkerPanic { message: e.to_string() })
            },
            Err(_) => {
                warn!(timeout_seconds = timeout.as_secs(), "dlq worker shutdown timed out");
                Err(WorkerError::ShutdownTimeout { timeout_seconds: timeout.as_secs() })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use backstop_core::{
        DlqId, DlqStatus, InMemoryDlqStore, MemoryQueue, MessageMetadata, StoreOperation,
        TestClock,
    };
    use serde_json::json;
    use sqlx::types::Json;

    use super::*;

    fn record(message_id: &str, error_type: &str, now: DateTime<Utc>) -> DlqMessage {
        DlqMessage {
            id: DlqId::new(),
            message_id: message_id.to_string(),
            original_message: Json(json!({"id": message_id})),
            error_reason: "failed".to_string(),
            error_stack: None,
            error_type: error_type.to_string(),
            retry_count: 3,
            dlq_retry_count: 0,
            first_failed_at: now,
            last_failed_at: now,
            status: DlqStatus::Pending,
            locked_by: None,
            locked_at: None,
            next_retry_at: None,
            metadata: Json(MessageMetadata::default()),
            replay_attempts: Json(Vec::new()),
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn worker(id: &str, store: &InMemoryDlqStore, clock: &TestClock) -> WorkerOrchestrator {
        let queue = Arc::new(MemoryQueue::new(Arc::new(clock.clone()), Duration::from_secs(300)));
        WorkerOrchestrator::with_worker_id(
            id,
            WorkerConfig::default(),
            Arc::new(store.clone()),
            queue,
            Arc::new(clock.clone()),
        )
        .unwrap()
    }

    #[test]
    fn generated_id_has_expected_shape() {
        let now = Utc::now();
        let id = generate_worker_id(now);

        assert!(id.starts_with("worker_"));
        assert!(id.ends_with(&format!("_{}_{}", std::process::id(), now.timestamp_millis())));
    }

    #[tokio::test]
    async fn batch_applies_strategy_per_category() {
        let clock = TestClock::new();
        let store = InMemoryDlqStore::new();
        let now = clock.now_utc();
        store.put(record("timeout", "TIMEOUT_ERROR", now)).await;
        store.put(record("invalid", "VALIDATION_ERROR", now)).await;
        store.put(record("mystery", "UNKNOWN_ERROR", now)).await;
        let worker = worker("worker_a", &store, &clock);

        let report = worker.run_once().await.unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(report.successful, 3);
        let status = |id: &str| {
            let store = store.clone();
            let id = id.to_string();
            async move { store.find_by_message_id(&id).await.unwrap().unwrap().status }
        };
        assert_eq!(status("timeout").await, DlqStatus::Pending);
        assert_eq!(status("invalid").await, DlqStatus::Failed);
        assert_eq!(status("mystery").await, DlqStatus::Manual);

        let stats = worker.stats().await;
        assert_eq!(stats.total_processed, 3);
        assert_eq!(stats.success_rate, Some(1.0));
        assert_eq!(stats.by_strategy.get(&RecoveryStrategy::ImmediateRetry), Some(&1));
    }

    #[tokio::test]
    async fn lock_contention_counts_as_skipped() {
        let clock = TestClock::new();
        let store = InMemoryDlqStore::new();
        let message = record("contended", "TIMEOUT_ERROR", clock.now_utc());
        store.put(message.clone()).await;
        store.acquire_lock(message.id, "worker_other", clock.now_utc()).await.unwrap();
        let worker = worker("worker_a", &store, &clock);

        let result = worker.process_message(&message).await;

        assert_eq!(result, MessageResult::Skipped);
        let stats = worker.stats().await;
        assert_eq!(stats.total_skipped, 1);
        assert_eq!(stats.total_processed, 0);
    }

    #[tokio::test]
    async fn stale_sweep_failure_does_not_abort_iteration() {
        let clock = TestClock::new();
        let store = InMemoryDlqStore::new();
        store.put(record("invalid", "VALIDATION_ERROR", clock.now_utc())).await;
        store.inject_error(StoreOperation::ClearStaleLocks, "timeout").await;
        let worker = worker("worker_a", &store, &clock);

        let report = worker.run_once().await.unwrap();

        assert_eq!(report.stale_locks_cleared, 0);
        assert_eq!(report.successful, 1);
    }

    #[tokio::test]
    async fn fetch_failure_fails_iteration() {
        let clock = TestClock::new();
        let store = InMemoryDlqStore::new();
        store.inject_error(StoreOperation::FindPending, "connection reset").await;
        let worker = worker("worker_a", &store, &clock);

        assert!(worker.run_once().await.is_err());
        assert!(worker.run_once().await.is_ok());
    }

    #[tokio::test]
    async fn spawned_worker_stops_on_shutdown() {
        let clock = TestClock::new();
        let store = InMemoryDlqStore::new();
        let worker = Arc::new(worker("worker_a", &store, &clock));

        let handle = Arc::clone(&worker).spawn(CancellationToken::new());
        tokio::task::yield_now().await;
        handle.shutdown(Duration::from_secs(5)).await.unwrap();

        let stats = worker.stats().await;
        assert!(!stats.is_running);
        assert!(stats.started_at.is_some());
    }
}
