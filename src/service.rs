//! Wires the breaker, router, processor pool and DLQ worker into one
//! running service.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use backstop_core::{Clock, DlqStore, EventHandler, LiveQueue, SystemProbe};
use backstop_pipeline::{
    CircuitBreaker, CircuitEvaluator, DlqRouter, MessageHandler, PrimaryProcessor, ProcessorPool,
    RetryManager,
};
use backstop_worker::{OperatorActions, WorkerHandle, WorkerOrchestrator};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;

/// Collaborators the service runs over.
///
/// Production passes Postgres-backed storage and the real clock; tests pass
/// in-memory doubles.
pub struct ServiceParts {
    /// DLQ persistence.
    pub store: Arc<dyn DlqStore>,
    /// Live message queue.
    pub queue: Arc<dyn LiveQueue>,
    /// Business logic applied to each message.
    pub handler: Arc<dyn MessageHandler>,
    /// Host snapshot recorded on dead-lettering.
    pub probe: Arc<dyn SystemProbe>,
    /// Monitoring sink.
    pub events: Arc<dyn EventHandler>,
    /// Time source for every component.
    pub clock: Arc<dyn Clock>,
}

/// Running service.
pub struct Service {
    breaker: Arc<CircuitBreaker>,
    router: Arc<DlqRouter>,
    processor: Arc<PrimaryProcessor>,
    worker: Arc<WorkerOrchestrator>,
    operator: OperatorActions,
    evaluator: CircuitEvaluator,
    pool: ProcessorPool,
    worker_handle: WorkerHandle,
}

impl Service {
    /// Builds every component from `config` and starts the background
    /// tasks: the breaker evaluator, the processor loops and the DLQ worker.
    ///
    /// # Errors
    ///
    /// Returns error if a component configuration is invalid.
    pub fn start(config: &Config, parts: ServiceParts) -> Result<Self> {
        let ServiceParts { store, queue, handler, probe, events, clock } = parts;
        let token = CancellationToken::new();
        let worker_config = config.to_worker_config()?;

        let breaker = Arc::new(CircuitBreaker::new(
            config.to_circuit_config(),
            clock.clone(),
            events.clone(),
        ));
        let router = Arc::new(DlqRouter::new(
            config.to_router_config(),
            store.clone(),
            probe,
            events,
            clock.clone(),
        ));
        let processor = Arc::new(PrimaryProcessor::new(
            config.to_processor_config(),
            queue.clone(),
            handler,
            breaker.clone(),
            RetryManager::new(config.to_retry_policy()),
            router.clone(),
            store.clone(),
            clock.clone(),
        ));
        let worker = WorkerOrchestrator::new(
            worker_config.clone(),
            store.clone(),
            queue.clone(),
            clock.clone(),
        )
        .context("Failed to create DLQ worker")?;
        let worker = Arc::new(worker);
        let operator = OperatorActions::new(Arc::new(worker_config), store, queue, clock);

        let mut pool = ProcessorPool::new(processor.clone(), token.child_token());
        pool.spawn().context("Failed to start processor loops")?;
        let evaluator = breaker.spawn_evaluator(token.child_token());
        let worker_handle = Arc::clone(&worker).spawn(token.child_token());

        info!(
            worker_id = worker.worker_id(),
            concurrency = processor.config().concurrency,
            "service started"
        );

        Ok(Self { breaker, router, processor, worker, operator, evaluator, pool, worker_handle })
    }

    /// Breaker guarding the primary path.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// DLQ router.
    pub fn router(&self) -> &Arc<DlqRouter> {
        &self.router
    }

    /// Primary processor, for pause, resume and stats.
    pub fn processor(&self) -> &Arc<PrimaryProcessor> {
        &self.processor
    }

    /// DLQ worker, for stats.
    pub fn worker(&self) -> &Arc<WorkerOrchestrator> {
        &self.worker
    }

    /// Operator actions over the DLQ.
    pub fn operator(&self) -> &OperatorActions {
        &self.operator
    }

    /// Stops the processor loops first, then the DLQ worker, then the
    /// evaluator. Each stage gets up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the first stage that failed to stop cleanly. Later stages
    /// are still stopped.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        info!(timeout_seconds = timeout.as_secs(), "stopping service");

        let pool = self.pool.shutdown_graceful(timeout).await.context("processor pool");
        let worker = self.worker_handle.shutdown(timeout).await.context("dlq worker");
        let evaluator = self.evaluator.shutdown().await.context("circuit evaluator");

        for result in [&pool, &worker, &evaluator] {
            if let Err(e) = result {
                warn!(error = %e, "shutdown stage failed");
            }
        }

        pool.and(worker).and(evaluator)?;
        info!("service stopped");
        Ok(())
    }
}
