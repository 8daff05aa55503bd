//! Primary processor and its task pool.
//!
//! Each processor loop leases envelopes from the live queue, runs the
//! message handler, feeds the outcome to the circuit breaker, and on failure
//! either re-enqueues the envelope with backoff or routes it to the DLQ.
//! No lock is held while the handler runs.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use backstop_core::{
    CircuitState, Clock, ClosingUpdate, Delivery, DlqId, DlqStatus, DlqStore, ErrorSignal,
    LiveQueue, QueueEnvelope, RecoveryStrategy, ReplayAttempt, ReplayOutcome,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    circuit::CircuitBreaker,
    error::{PipelineError, Result},
    handler::MessageHandler,
    retry::{RetryDecision, RetryManager},
    router::DlqRouter,
};

/// Identity recorded when a replayed message succeeds on the primary path.
const PROCESSOR_IDENTITY: &str = "primary-processor";

/// Pause after a queue error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Processor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Number of concurrent processor loops.
    pub concurrency: usize,
    /// Sleep when the queue is empty, paused, or the circuit is open.
    pub poll_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self { concurrency: 4, poll_interval: Duration::from_secs(1) }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Handler succeeded.
    Succeeded,
    /// Handler failed; the envelope was re-enqueued.
    Retried {
        /// Delay before it becomes visible again
        delay: Duration,
        /// Retry count it now carries
        retry_count: u32,
    },
    /// Handler failed for good; the envelope is in the DLQ.
    DeadLettered {
        /// New DLQ record
        dlq_id: DlqId,
    },
    /// Routing to the DLQ failed. The delivery is left unacknowledged so the
    /// queue redelivers it once its lease expires.
    DeadLetterFailed {
        /// Why routing failed
        error: String,
    },
}

/// Processor counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorStats {
    /// Successful deliveries.
    pub processed: u64,
    /// Failed deliveries, whatever happened next.
    pub failed: u64,
    /// Failures re-enqueued.
    pub retried: u64,
    /// Failures routed to the DLQ.
    pub dead_lettered: u64,
    /// Failures the DLQ could not take.
    pub dlq_route_failures: u64,
    /// Share of successful deliveries; zero before the first success.
    pub success_rate: f64,
    /// Whether processing is paused.
    pub paused: bool,
    /// Breaker state at the time of the snapshot.
    pub circuit_state: CircuitState,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    dlq_route_failures: AtomicU64,
}

/// Consumes the live queue.
#[derive(Debug)]
pub struct PrimaryProcessor {
    config: ProcessorConfig,
    queue: Arc<dyn LiveQueue>,
    handler: Arc<dyn MessageHandler>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryManager,
    router: Arc<DlqRouter>,
    store: Arc<dyn DlqStore>,
    clock: Arc<dyn Clock>,
    paused: AtomicBool,
    counters: Counters,
}

impl PrimaryProcessor {
    /// Creates a processor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ProcessorConfig,
        queue: Arc<dyn LiveQueue>,
        handler: Arc<dyn MessageHandler>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryManager,
        router: Arc<DlqRouter>,
        store: Arc<dyn DlqStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            queue,
            handler,
            breaker,
            retry,
            router,
            store,
            clock,
            paused: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Stops taking new deliveries. In-flight ones finish.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        info!("message processing paused");
    }

    /// Resumes taking deliveries.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        info!("message processing resumed");
    }

    /// Returns true while paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Counter snapshot.
    pub async fn stats(&self) -> ProcessorStats {
        let processed = self.counters.processed.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let success_rate =
            if processed == 0 { 0.0 } else { processed as f64 / (processed + failed) as f64 };

        ProcessorStats {
            processed,
            failed,
            retried: self.counters.retried.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            dlq_route_failures: self.counters.dlq_route_failures.load(Ordering::Relaxed),
            success_rate,
            paused: self.is_paused(),
            circuit_state: self.breaker.state().await,
        }
    }

    /// Processes one leased delivery.
    ///
    /// Never fails: every error is either handled by retry or routing, or
    /// logged. The delivery is acknowledged unless routing to the DLQ failed.
    pub async fn process(&self, delivery: Delivery) -> ProcessOutcome {
        let Delivery { receipt, envelope } = delivery;
        let message_id = envelope.message_id.as_str();
        debug!(message_id, retry_count = envelope.retry_count, "processing message");

        let outcome = match self.handler.handle(&envelope).await {
            Ok(_) => {
                self.breaker.record_success().await;
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                info!(message_id, retry_count = envelope.retry_count, "message processed");

                if let Some(dlq_id) = envelope.original_dlq_id {
                    self.resolve_replayed(dlq_id, message_id).await;
                }
                ProcessOutcome::Succeeded
            },
            Err(signal) => {
                self.breaker.record_failure().await;
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    message_id,
                    retry_count = envelope.retry_count,
                    error = %signal,
                    "message processing failed"
                );
                self.handle_failure(&envelope, &signal).await
            },
        };

        if matches!(outcome, ProcessOutcome::DeadLetterFailed { .. }) {
            warn!(message_id, "leaving delivery unacknowledged for redelivery");
        } else if let Err(e) = self.queue.ack(receipt).await {
            warn!(message_id, error = %e, "failed to acknowledge delivery");
        }

        outcome
    }

    async fn handle_failure(&self, envelope: &QueueEnvelope, signal: &ErrorSignal) -> ProcessOutcome {
        let decision = self.retry.decide(envelope.retry_count, signal);
        debug!(
            message_id = %envelope.message_id,
            action = ?decision.action,
            reason = %decision.reason,
            delay_ms = decision.delay.as_millis(),
            "retry decision"
        );

        if decision.is_retry() {
            let next = self.retry.prepare_retry(envelope, signal, self.clock.now_utc());
            let retry_count = next.retry_count;
            match self.queue.enqueue(next, decision.delay).await {
                Ok(()) => {
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    info!(
                        message_id = %envelope.message_id,
                        retry_count,
                        delay_ms = decision.delay.as_millis(),
                        "message scheduled for retry"
                    );
                    return ProcessOutcome::Retried { delay: decision.delay, retry_count };
                },
                Err(e) => {
                    error!(
                        message_id = %envelope.message_id,
                        error = %e,
                        "failed to re-enqueue message, routing to dlq"
                    );
                },
            }
        }

        self.route(envelope, signal, &decision).await
    }

    async fn route(
        &self,
        envelope: &QueueEnvelope,
        signal: &ErrorSignal,
        decision: &RetryDecision,
    ) -> ProcessOutcome {
        match self.router.route(envelope, signal, decision).await {
            Ok(stored) => {
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                ProcessOutcome::DeadLettered { dlq_id: stored.id }
            },
            Err(e) => {
                self.counters.dlq_route_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    message_id = %envelope.message_id,
                    error = %e,
                    "critical: message could not be dead-lettered"
                );
                ProcessOutcome::DeadLetterFailed { error: e.to_string() }
            },
        }
    }

    /// Closes the DLQ record a successful replay came from. Best effort.
    async fn resolve_replayed(&self, dlq_id: DlqId, message_id: &str) {
        let strategy = match self.store.find_by_id(dlq_id).await {
            Ok(Some(record)) => record
                .replay_attempts
                .0
                .last()
                .map_or(RecoveryStrategy::ImmediateRetry, |attempt| attempt.strategy),
            Ok(None) => {
                debug!(%dlq_id, message_id, "replayed dlq record no longer exists");
                return;
            },
            Err(e) => {
                warn!(%dlq_id, message_id, error = %e, "failed to load replayed dlq record");
                return;
            },
        };

        let now = self.clock.now_utc();
        let update = ClosingUpdate {
            status: DlqStatus::Resolved,
            resolved_by: PROCESSOR_IDENTITY.to_string(),
            resolution_notes: Some(format!("replay {message_id} processed successfully")),
            attempt: ReplayAttempt {
                timestamp: now,
                worker_id: PROCESSOR_IDENTITY.to_string(),
                strategy,
                result: ReplayOutcome::Resolved,
                notes: Some(format!("replay {message_id} succeeded on the primary path")),
            },
        };

        match self.store.close(dlq_id, update, now).await {
            Ok(true) => info!(%dlq_id, message_id, "dlq record resolved by successful replay"),
            Ok(false) => debug!(%dlq_id, message_id, "dlq record already closed or locked"),
            Err(e) => warn!(%dlq_id, message_id, error = %e, "failed to resolve dlq record"),
        }
    }

    /// Runs the processing loop until `token` is cancelled.
    ///
    /// While paused or while the breaker blocks requests, the loop sleeps
    /// instead of dequeuing.
    ///
    /// # Errors
    ///
    /// Currently never returns error; queue failures are logged and retried.
    pub async fn run(self: Arc<Self>, worker_id: usize, token: CancellationToken) -> Result<()> {
        info!(worker_id, "processor loop started");

        loop {
            if token.is_cancelled() {
                break;
            }

            let admission =
                if self.is_paused() { None } else { self.breaker.check().await.ok() };
            let Some(admission) = admission else {
                tokio::select! {
                    () = self.clock.sleep(self.config.poll_interval) => {}
                    () = token.cancelled() => break,
                }
                continue;
            };

            match self.queue.dequeue().await {
                Ok(Some(delivery)) => {
                    self.process(delivery).await;
                },
                Ok(None) => {
                    self.breaker.release(admission).await;
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {}
                        () = token.cancelled() => break,
                    }
                },
                Err(e) => {
                    self.breaker.release(admission).await;
                    error!(worker_id, error = %e, "failed to dequeue message");
                    tokio::select! {
                        () = self.clock.sleep(ERROR_BACKOFF) => {}
                        () = token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id, "processor loop stopped");
        Ok(())
    }
}

/// Set of processor loops sharing one processor.
#[derive(Debug)]
pub struct ProcessorPool {
    processor: Arc<PrimaryProcessor>,
    cancellation_token: CancellationToken,
    handles: Vec<JoinHandle<Result<()>>>,
}

impl ProcessorPool {
    /// Creates an idle pool.
    pub fn new(processor: Arc<PrimaryProcessor>, cancellation_token: CancellationToken) -> Self {
        Self { processor, cancellation_token, handles: Vec::new() }
    }

    /// Spawns `config.concurrency` processor loops.
    ///
    /// # Errors
    ///
    /// Returns error if the configured concurrency is zero.
    pub fn spawn(&mut self) -> Result<()> {
        let concurrency = self.processor.config().concurrency;
        if concurrency == 0 {
            return Err(PipelineError::configuration("processor concurrency must be positive"));
        }

        for worker_id in 0..concurrency {
            let processor = Arc::clone(&self.processor);
            let token = self.cancellation_token.clone();
            self.handles.push(tokio::spawn(async move { processor.run(worker_id, token).await }));
        }

        info!(concurrency, "processor loops spawned");
        Ok(())
    }

    /// Returns true while any loop is running.
    pub fn has_active_workers(&self) -> bool {
        self.handles.iter().any(|handle| !handle.is_finished())
    }

    /// Cancels every loop and waits for them, up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns error if the loops do not stop in time.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            loops = self.handles.len(),
            timeout_seconds = timeout.as_secs(),
            "stopping processor loops"
        );
        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.handles);
        let joined = async {
            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(e)) => warn!(worker_id, error = %e, "processor loop ended with error"),
                    Err(e) => error!(worker_id, error = %e, "processor loop panicked"),
                }
            }
        };

        if tokio::time::timeout(timeout, joined).await.is_err() {
            error!(timeout_seconds = timeout.as_secs(), "processor shutdown timed out");
            return Err(PipelineError::ShutdownTimeout { timeout_seconds: timeout.as_secs() });
        }

        info!("processor loops stopped");
        Ok(())
    }
}

impl Drop for ProcessorPool {
    fn drop(&mut self) {
        if self.has_active_workers() && !self.cancellation_token.is_cancelled() {
            warn!("processor pool dropped without shutdown, cancelling loops");
            self.cancellation_token.cancel();
        }
    }
}
