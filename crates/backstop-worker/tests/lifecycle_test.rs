//! Full message lifecycle: primary path, dead-lettering, DLQ recovery and
//! the replay landing back on the primary path.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use backstop_core::{Clock, DlqStatus, LiveQueue, RecoveryStrategy, ReplayOutcome};
use backstop_pipeline::{ProcessOutcome, SimulatedHandler};
use backstop_testing::{EnvelopeBuilder, TestEnv};
use tokio_util::sync::CancellationToken;

/// Processes visible envelopes, sleeping through retry backoff, until one
/// leaves the primary path.
async fn exhaust_primary_path(env: &TestEnv) -> Result<ProcessOutcome> {
    loop {
        match env.process_next().await? {
            Some(ProcessOutcome::Retried { delay, .. }) => env.advance(delay),
            Some(outcome) => return Ok(outcome),
            None => anyhow::bail!("queue drained without a final outcome"),
        }
    }
}

#[tokio::test]
async fn transient_outage_recovers_through_the_dlq() -> Result<()> {
    let env = TestEnv::new();
    // Initial attempt plus three primary retries.
    env.handler.fail("order-1", SimulatedHandler::failure_for("TIMEOUT_ERROR"), 4).await;
    env.publish(EnvelopeBuilder::new("order-1").build()).await?;

    let outcome = exhaust_primary_path(&env).await?;
    assert!(matches!(outcome, ProcessOutcome::DeadLettered { .. }));

    let worker = env.worker("worker-a")?;
    assert_eq!(worker.run_once().await?.fetched, 0, "entry delay not yet over");

    env.advance(Duration::from_secs(60));
    let report = worker.run_once().await?;
    assert_eq!(report.successful, 1);

    // The replay shows up once the first backoff step has passed.
    assert_eq!(env.process_next().await?, None);
    env.advance(Duration::from_secs(60));
    assert_eq!(env.process_next().await?, Some(ProcessOutcome::Succeeded));

    let record = env.dlq_record("order-1").await?;
    assert_eq!(record.status, DlqStatus::Resolved);
    assert_eq!(record.resolved_by.as_deref(), Some("primary-processor"));
    assert_eq!(record.dlq_retry_count, 1);

    let attempts = &record.replay_attempts.0;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].worker_id, "worker-a");
    assert_eq!(attempts[0].result, ReplayOutcome::Scheduled);
    assert_eq!(attempts[1].strategy, RecoveryStrategy::ImmediateRetry);
    assert_eq!(attempts[1].result, ReplayOutcome::Resolved);

    assert_eq!(worker.run_once().await?.fetched, 0);
    assert_eq!(env.queue.depth().await?, 0);
    assert_eq!(env.dlq().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn permanent_failure_ends_with_an_operator() -> Result<()> {
    let env = TestEnv::new();
    env.handler.fail("order-2", SimulatedHandler::failure_for("VALIDATION_ERROR"), 1).await;
    env.publish(EnvelopeBuilder::new("order-2").build()).await?;

    let outcome = exhaust_primary_path(&env).await?;
    assert!(matches!(outcome, ProcessOutcome::DeadLettered { .. }));
    assert_eq!(env.handler.calls(), 1);

    env.advance(Duration::from_secs(60));
    env.worker("worker-a")?.run_once().await?;
    assert_eq!(env.dlq_record("order-2").await?.status, DlqStatus::Failed);

    // Producer fixed; the operator pushes it through again.
    let receipt = env.operator().replay("order-2", "bob").await?;
    assert_eq!(env.process_next().await?, Some(ProcessOutcome::Succeeded));

    let record = env.dlq_record("order-2").await?;
    assert_eq!(record.status, DlqStatus::Replayed);
    let seen = env.handler.seen().await;
    assert_eq!(seen.last().map(|e| e.message_id.clone()), Some(receipt.replay_message_id));
    Ok(())
}

#[tokio::test]
async fn failing_replay_is_dead_lettered_on_its_own() -> Result<()> {
    let env = TestEnv::new();
    env.handler.fail_by_default(SimulatedHandler::failure_for("TIMEOUT_ERROR")).await;
    env.publish(EnvelopeBuilder::new("order-3").build()).await?;
    exhaust_primary_path(&env).await?;
    let first_failure = env.dlq_record("order-3").await?.last_failed_at;

    env.advance(Duration::from_secs(60));
    env.worker("worker-a")?.run_once().await?;
    env.advance(Duration::from_secs(60));
    env.handler.fail_by_default(SimulatedHandler::failure_for("SERVICE_UNAVAILABLE")).await;

    let outcome = exhaust_primary_path(&env).await?;
    assert!(matches!(outcome, ProcessOutcome::DeadLettered { .. }));

    let records = env.dlq().await;
    assert_eq!(records.len(), 2);
    let original = env.dlq_record("order-3").await?;
    assert_eq!(original.status, DlqStatus::Pending);
    assert_eq!(original.dlq_retry_count, 1);
    assert!(original.last_failed_at > first_failure);
    assert_eq!(original.last_failed_at, env.clock.now_utc());
    assert_eq!(original.error_type, "SERVICE_UNAVAILABLE");

    let replay = records
        .iter()
        .find(|record| record.message_id != "order-3")
        .ok_or_else(|| anyhow::anyhow!("replay was not dead-lettered"))?;
    assert!(replay.message_id.starts_with("dlq_retry_order-3_"));
    assert!(replay.metadata.0.tags.iter().any(|tag| tag == "dlq_retry"));
    Ok(())
}

#[tokio::test]
async fn spawned_worker_drains_the_dlq_and_stops() -> Result<()> {
    let env = TestEnv::new();
    env.handler.fail("order-4", SimulatedHandler::failure_for("VALIDATION_ERROR"), 1).await;
    env.publish(EnvelopeBuilder::new("order-4").build()).await?;
    exhaust_primary_path(&env).await?;

    let worker = Arc::new(env.worker("worker-a")?);
    let handle = Arc::clone(&worker).spawn(CancellationToken::new());

    for _ in 0..10_000 {
        if env.dlq_record("order-4").await?.status == DlqStatus::Failed {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(handle.is_running());
    handle.shutdown(Duration::from_secs(5)).await?;

    assert_eq!(env.dlq_record("order-4").await?.status, DlqStatus::Failed);
    let stats = worker.stats().await;
    assert!(!stats.is_running);
    assert!(stats.iterations >= 1);
    assert_eq!(stats.by_strategy.get(&RecoveryStrategy::MarkAsFailed), Some(&1));
    Ok(())
}
