//! Integration tests for the primary processor.
//!
//! Drives the processor over the in-memory queue and DLQ store with a
//! manually advanced clock, covering the success path, backoff retries,
//! dead-lettering and the pool's behaviour when the breaker or an operator
//! holds it back.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use backstop_core::{
    CircuitState, Clock, DlqStatus, ErrorSignal, LiveQueue, ReplayOutcome, StoreOperation,
};
use backstop_pipeline::{
    PrimaryProcessor, ProcessOutcome, ProcessorConfig, ProcessorPool, RetryManager,
    SimulatedHandler,
};
use backstop_testing::{DlqMessageBuilder, EnvelopeBuilder, TestEnv};
use chrono::Duration as ChronoDuration;
use tokio_util::sync::CancellationToken;

async fn spin_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn successful_message_is_acknowledged() -> Result<()> {
    let env = TestEnv::new();
    env.publish(EnvelopeBuilder::new("order-1").build()).await?;

    let outcome = env.process_next().await?;

    assert_eq!(outcome, Some(ProcessOutcome::Succeeded));
    assert_eq!(env.queue.depth().await?, 0);
    assert!(env.dlq().await.is_empty());
    assert_eq!(env.handler.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn transient_failure_is_retried_with_backoff() -> Result<()> {
    let env = TestEnv::new();
    env.handler.fail("order-2", SimulatedHandler::failure_for("TIMEOUT_ERROR"), 1).await;
    env.publish(EnvelopeBuilder::new("order-2").build()).await?;

    let first = env.process_next().await?;
    assert_eq!(
        first,
        Some(ProcessOutcome::Retried { delay: Duration::from_millis(1000), retry_count: 1 })
    );
    assert_eq!(env.queue.visible_in("order-2").await, Some(Duration::from_millis(1000)));

    // Not visible before the backoff elapses.
    assert_eq!(env.process_next().await?, None);

    env.advance(Duration::from_millis(1000));
    assert_eq!(env.process_next().await?, Some(ProcessOutcome::Succeeded));

    let seen = env.handler.seen().await;
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].retry_count, 1);
    assert_eq!(seen[1].retry_history.len(), 1);
    assert!(seen[1].first_failed_at.is_some());
    assert_eq!(
        seen[1].last_error.as_ref().map(|e| e.message.as_str()),
        Some("External API timeout after 5000ms")
    );
    assert!(env.dlq().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_route_to_dlq() -> Result<()> {
    let env = TestEnv::new();
    env.handler.fail_by_default(SimulatedHandler::failure_for("TIMEOUT_ERROR")).await;
    env.publish(EnvelopeBuilder::new("order-3").source("checkout").priority(1).build()).await?;

    for (expected_delay, expected_count) in [(1000, 1), (2000, 2), (4000, 3)] {
        let outcome = env.process_next().await?;
        assert_eq!(
            outcome,
            Some(ProcessOutcome::Retried {
                delay: Duration::from_millis(expected_delay),
                retry_count: expected_count,
            })
        );
        env.advance(Duration::from_millis(expected_delay));
    }

    let routed_at = env.clock.now_utc();
    let outcome = env.process_next().await?;
    assert!(matches!(outcome, Some(ProcessOutcome::DeadLettered { .. })));
    assert_eq!(env.queue.depth().await?, 0);

    let record = env.dlq_record("order-3").await?;
    assert_eq!(record.status, DlqStatus::Pending);
    assert_eq!(record.retry_count, 3);
    assert_eq!(record.dlq_retry_count, 0);
    assert_eq!(record.error_type, "TIMEOUT_ERROR");
    assert_eq!(record.error_reason, "External API timeout after 5000ms");
    assert_eq!(record.metadata.0.source, "checkout");
    assert_eq!(record.metadata.0.priority, 1);
    assert!(record.metadata.0.system_state.is_some());
    assert_eq!(record.next_retry_at, Some(routed_at + ChronoDuration::seconds(60)));
    assert!(record.first_failed_at < record.last_failed_at);

    assert_eq!(env.events.dead_lettered().await, vec!["order-3".to_string()]);
    Ok(())
}

#[tokio::test]
async fn permanent_failure_skips_retries() -> Result<()> {
    let env = TestEnv::new();
    env.publish(EnvelopeBuilder::new("bad-payload").build()).await?;
    env.handler
        .fail("bad-payload", SimulatedHandler::failure_for("VALIDATION_ERROR"), 1)
        .await;

    let outcome = env.process_next().await?;

    assert!(matches!(outcome, Some(ProcessOutcome::DeadLettered { .. })));
    let record = env.dlq_record("bad-payload").await?;
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.error_type, "VALIDATION_ERROR");
    assert_eq!(env.queue.enqueued_total().await, 1);
    Ok(())
}

#[tokio::test]
async fn uncoded_failure_stores_its_classification() -> Result<()> {
    let env = TestEnv::new();
    env.publish(EnvelopeBuilder::new("no-code").build()).await?;
    env.handler.fail("no-code", ErrorSignal::new("request was invalid"), 1).await;

    env.process_next().await?;

    let record = env.dlq_record("no-code").await?;
    assert_eq!(record.error_type, "PERMANENT_ERROR");
    Ok(())
}

#[tokio::test]
async fn failed_routing_leaves_delivery_for_redelivery() -> Result<()> {
    let env = TestEnv::new();
    env.store.inject_error(StoreOperation::Insert, "connection reset by peer").await;
    env.handler
        .fail("fragile", SimulatedHandler::failure_for("VALIDATION_ERROR"), 2)
        .await;
    env.publish(EnvelopeBuilder::new("fragile").build()).await?;

    let outcome = env.process_next().await?;
    assert!(matches!(outcome, Some(ProcessOutcome::DeadLetterFailed { .. })));
    assert_eq!(env.queue.depth().await?, 1);
    assert!(env.dlq().await.is_empty());
    assert_eq!(env.events.dead_letter_failures().await, vec!["fragile".to_string()]);

    // Leased until the visibility timeout runs out.
    assert_eq!(env.process_next().await?, None);
    env.advance(Duration::from_secs(300));

    let redelivered = env.process_next().await?;
    assert!(matches!(redelivered, Some(ProcessOutcome::DeadLettered { .. })));
    assert_eq!(env.queue.depth().await?, 0);
    assert_eq!(env.dlq().await.len(), 1);

    let stats = env.processor.stats().await;
    assert_eq!(stats.dlq_route_failures, 1);
    assert_eq!(stats.dead_lettered, 1);
    Ok(())
}

#[tokio::test]
async fn successful_replay_resolves_its_dlq_record() -> Result<()> {
    let env = TestEnv::new();
    let now = env.clock.now_utc();
    let record = DlqMessageBuilder::new("order-9", now).build();
    env.store.put(record.clone()).await;

    env.publish(EnvelopeBuilder::new("dlq_retry_order-9_1").replay_of(record.id).build()).await?;
    assert_eq!(env.process_next().await?, Some(ProcessOutcome::Succeeded));

    let resolved = env.dlq_record("order-9").await?;
    assert_eq!(resolved.status, DlqStatus::Resolved);
    assert_eq!(resolved.resolved_by.as_deref(), Some("primary-processor"));
    assert!(resolved.resolved_at.is_some());
    let attempt = resolved.replay_attempts.0.last().map(|a| a.result);
    assert_eq!(attempt, Some(ReplayOutcome::Resolved));
    Ok(())
}

#[tokio::test]
async fn replay_of_closed_record_leaves_it_alone() -> Result<()> {
    let env = TestEnv::new();
    let now = env.clock.now_utc();
    let record = DlqMessageBuilder::new("order-10", now).status(DlqStatus::Replayed).build();
    env.store.put(record.clone()).await;

    env.publish(EnvelopeBuilder::new("replay-10").replay_of(record.id).build()).await?;
    assert_eq!(env.process_next().await?, Some(ProcessOutcome::Succeeded));

    let unchanged = env.dlq_record("order-10").await?;
    assert_eq!(unchanged.status, DlqStatus::Replayed);
    assert!(unchanged.resolved_by.is_none());
    Ok(())
}

#[tokio::test]
async fn open_circuit_holds_back_the_pool() -> Result<()> {
    let env = TestEnv::new();
    env.breaker.force_state(CircuitState::Open).await;
    env.publish(EnvelopeBuilder::new("held").build()).await?;

    let mut pool = ProcessorPool::new(env.processor.clone(), CancellationToken::new());
    pool.spawn()?;
    assert!(pool.has_active_workers());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(env.handler.calls(), 0);
    assert_eq!(env.queue.depth().await?, 1);

    env.breaker.force_state(CircuitState::Closed).await;
    spin_until(|| env.handler.calls() > 0).await;
    assert_eq!(env.handler.calls(), 1);

    pool.shutdown_graceful(Duration::from_secs(5)).await?;
    Ok(())
}

#[tokio::test]
async fn empty_polls_do_not_use_up_half_open_trials() -> Result<()> {
    let env = TestEnv::new();
    env.breaker.force_state(CircuitState::HalfOpen).await;

    let mut pool = ProcessorPool::new(env.processor.clone(), CancellationToken::new());
    pool.spawn()?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(env.breaker.should_allow_request().await);

    env.publish(EnvelopeBuilder::new("probe").build()).await?;
    spin_until(|| env.handler.calls() > 0).await;
    pool.shutdown_graceful(Duration::from_secs(5)).await?;

    assert_eq!(env.handler.calls(), 1);
    let metrics = env.breaker.metrics().await;
    assert_eq!(metrics.state, CircuitState::HalfOpen);
    assert_eq!(metrics.half_open_successes, 1);
    Ok(())
}

#[tokio::test]
async fn paused_processor_takes_nothing() -> Result<()> {
    let env = TestEnv::new();
    env.processor.pause();
    env.publish(EnvelopeBuilder::new("later").build()).await?;

    let mut pool = ProcessorPool::new(env.processor.clone(), CancellationToken::new());
    pool.spawn()?;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(env.handler.calls(), 0);
    assert!(env.processor.stats().await.paused);

    env.processor.resume();
    spin_until(|| env.handler.calls() > 0).await;
    assert_eq!(env.handler.calls(), 1);

    pool.shutdown_graceful(Duration::from_secs(5)).await?;
    assert_eq!(env.queue.depth().await?, 0);
    Ok(())
}

#[tokio::test]
async fn stats_count_each_outcome() -> Result<()> {
    let env = TestEnv::new();
    env.handler.fail("b", SimulatedHandler::failure_for("TIMEOUT_ERROR"), 1).await;
    env.handler.fail("c", SimulatedHandler::failure_for("VALIDATION_ERROR"), 1).await;
    for id in ["a", "b", "c"] {
        env.publish(EnvelopeBuilder::new(id).build()).await?;
    }

    let outcomes = env.drain(10).await?;
    assert_eq!(outcomes.len(), 3);

    let stats = env.processor.stats().await;
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.dlq_route_failures, 0);
    assert!((stats.success_rate - 1.0 / 3.0).abs() < f64::EPSILON);
    assert_eq!(stats.circuit_state, CircuitState::Closed);
    Ok(())
}

#[tokio::test]
async fn zero_concurrency_is_rejected() {
    let env = TestEnv::new();
    let processor = Arc::new(PrimaryProcessor::new(
        ProcessorConfig { concurrency: 0, ..ProcessorConfig::default() },
        env.queue.clone(),
        env.handler.clone(),
        env.breaker.clone(),
        RetryManager::default(),
        env.router.clone(),
        Arc::new(env.store.clone()),
        Arc::new(env.clock.clone()),
    ));

    let mut pool = ProcessorPool::new(processor, CancellationToken::new());
    assert!(pool.spawn().is_err());
    assert!(!pool.has_active_workers());
}
