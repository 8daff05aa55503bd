//! In-memory wiring of the whole pipeline.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use backstop_core::{
    Clock, DlqMessage, DlqStore, InMemoryDlqStore, LiveQueue, MemoryQueue, QueueEnvelope,
    TestClock,
};
use backstop_pipeline::{
    CircuitBreaker, CircuitConfig, DlqRouter, PrimaryProcessor, ProcessOutcome, ProcessorConfig,
    RetryManager, RetryPolicy, RouterConfig,
};
use backstop_worker::{OperatorActions, WorkerConfig, WorkerOrchestrator};

use crate::doubles::{RecordingEventHandler, ScriptedHandler, StaticProbe};

/// Configures a [`TestEnv`].
///
/// Defaults differ from production where it keeps tests short and
/// deterministic: no retry jitter, and a breaker that needs only 4 samples.
#[derive(Debug, Clone)]
pub struct TestEnvBuilder {
    circuit: CircuitConfig,
    retry: RetryPolicy,
    router: RouterConfig,
    processor: ProcessorConfig,
    worker: WorkerConfig,
    visibility_timeout: Duration,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            circuit: CircuitConfig { minimum_requests: 4, ..CircuitConfig::default() },
            retry: RetryPolicy { jitter_percent: 0.0, ..RetryPolicy::default() },
            router: RouterConfig::default(),
            processor: ProcessorConfig { concurrency: 1, ..ProcessorConfig::default() },
            worker: WorkerConfig::default(),
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

impl TestEnvBuilder {
    /// Overrides the breaker configuration.
    #[must_use]
    pub fn circuit(mut self, config: CircuitConfig) -> Self {
        self.circuit = config;
        self
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Overrides the router configuration.
    #[must_use]
    pub fn router(mut self, config: RouterConfig) -> Self {
        self.router = config;
        self
    }

    /// Overrides the worker configuration.
    #[must_use]
    pub fn worker(mut self, config: WorkerConfig) -> Self {
        self.worker = config;
        self
    }

    /// Builds the environment.
    pub fn build(self) -> TestEnv {
        let clock = TestClock::new();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = InMemoryDlqStore::new();
        let dyn_store: Arc<dyn DlqStore> = Arc::new(store.clone());
        let queue = Arc::new(MemoryQueue::new(shared_clock.clone(), self.visibility_timeout));
        let events = RecordingEventHandler::new();
        let handler = ScriptedHandler::new();

        let breaker =
            Arc::new(CircuitBreaker::new(self.circuit, shared_clock.clone(), events.clone()));
        let router = Arc::new(DlqRouter::new(
            self.router,
            dyn_store.clone(),
            Arc::new(StaticProbe::new(clock.now_utc())),
            events.clone(),
            shared_clock.clone(),
        ));
        let processor = Arc::new(PrimaryProcessor::new(
            self.processor,
            queue.clone(),
            handler.clone(),
            breaker.clone(),
            RetryManager::new(self.retry),
            router.clone(),
            dyn_store,
            shared_clock,
        ));

        TestEnv {
            clock,
            store,
            queue,
            events,
            handler,
            breaker,
            router,
            processor,
            worker_config: self.worker,
        }
    }
}

/// Pipeline over in-memory doubles and a [`TestClock`].
#[derive(Debug)]
pub struct TestEnv {
    /// Drives every timer.
    pub clock: TestClock,
    /// DLQ store.
    pub store: InMemoryDlqStore,
    /// Live queue.
    pub queue: Arc<MemoryQueue>,
    /// Monitoring events.
    pub events: Arc<RecordingEventHandler>,
    /// Business logic.
    pub handler: Arc<ScriptedHandler>,
    /// Breaker shared by the processor.
    pub breaker: Arc<CircuitBreaker>,
    /// DLQ router.
    pub router: Arc<DlqRouter>,
    /// Primary processor.
    pub processor: Arc<PrimaryProcessor>,
    worker_config: WorkerConfig,
}

impl TestEnv {
    /// Environment with the builder defaults.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts a builder.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::default()
    }

    /// DLQ worker named `worker_id` over this environment.
    ///
    /// # Errors
    ///
    /// Returns error if the worker configuration is invalid.
    pub fn worker(&self, worker_id: &str) -> Result<WorkerOrchestrator> {
        Ok(WorkerOrchestrator::with_worker_id(
            worker_id,
            self.worker_config.clone(),
            Arc::new(self.store.clone()),
            self.queue.clone(),
            Arc::new(self.clock.clone()),
        )?)
    }

    /// Operator actions over this environment.
    pub fn operator(&self) -> OperatorActions {
        OperatorActions::new(
            Arc::new(self.worker_config.clone()),
            Arc::new(self.store.clone()),
            self.queue.clone(),
            Arc::new(self.clock.clone()),
        )
    }

    /// Puts an envelope on the live queue, visible right away.
    ///
    /// # Errors
    ///
    /// Returns error if the queue refuses it.
    pub async fn publish(&self, envelope: QueueEnvelope) -> Result<()> {
        self.queue.enqueue(envelope, Duration::ZERO).await?;
        Ok(())
    }

    /// Dequeues and processes the next visible envelope.
    ///
    /// # Errors
    ///
    /// Returns error if the queue fails.
    pub async fn process_next(&self) -> Result<Option<ProcessOutcome>> {
        match self.queue.dequeue().await? {
            Some(delivery) => Ok(Some(self.processor.process(delivery).await)),
            None => Ok(None),
        }
    }

    /// Processes visible envelopes until none is left or `limit` is hit.
    ///
    /// # Errors
    ///
    /// Returns error if the queue fails.
    pub async fn drain(&self, limit: usize) -> Result<Vec<ProcessOutcome>> {
        let mut outcomes = Vec::new();
        while outcomes.len() < limit {
            match self.process_next().await? {
                Some(outcome) => outcomes.push(outcome),
                None => break,
            }
        }
        Ok(outcomes)
    }

    /// Advances the clock.
    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Every DLQ record.
    pub async fn dlq(&self) -> Vec<DlqMessage> {
        self.store.all().await
    }

    /// DLQ record for `message_id`.
    ///
    /// # Errors
    ///
    /// Returns error if there is none.
    pub async fn dlq_record(&self, message_id: &str) -> Result<DlqMessage> {
        self.store
            .find_by_message_id(message_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no dlq record for {message_id}"))
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
