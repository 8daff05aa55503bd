//! Property-based tests for the circuit breaker state machine.
//!
//! Arbitrary interleavings of outcomes, evaluations and clock movement must
//! only ever produce the four legal edges, and the breaker must never let a
//! request through while open.

use std::{sync::Arc, time::Duration};

use backstop_core::{CircuitState, MonitoringEvent};
use backstop_pipeline::{CircuitBreaker, CircuitConfig};
use backstop_testing::{RecordingEventHandler, TestClock};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Success,
    Failure,
    Evaluate,
    Advance(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Success),
        3 => Just(Op::Failure),
        2 => Just(Op::Evaluate),
        1 => (0u64..45).prop_map(Op::Advance),
    ]
}

fn breaker(minimum_requests: usize) -> (CircuitBreaker, TestClock, Arc<RecordingEventHandler>) {
    let clock = TestClock::new();
    let events = RecordingEventHandler::new();
    let config = CircuitConfig { minimum_requests, ..CircuitConfig::default() };
    let breaker = CircuitBreaker::new(config, Arc::new(clock.clone()), events.clone());
    (breaker, clock, events)
}

fn is_legal(from: CircuitState, to: CircuitState) -> bool {
    matches!(
        (from, to),
        (CircuitState::Closed, CircuitState::Open)
            | (CircuitState::Open, CircuitState::HalfOpen)
            | (CircuitState::HalfOpen, CircuitState::Closed)
            | (CircuitState::HalfOpen, CircuitState::Open)
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn only_legal_transitions_occur(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (breaker, clock, events) = breaker(4);

            for op in ops {
                match op {
                    Op::Success => breaker.record_success().await,
                    Op::Failure => breaker.record_failure().await,
                    Op::Evaluate => {
                        breaker.evaluate().await;
                    },
                    Op::Advance(secs) => clock.advance(Duration::from_secs(secs)),
                }

                if breaker.state().await == CircuitState::Open {
                    prop_assert!(!breaker.should_allow_request().await);
                }
            }

            let transitions: Vec<_> = events
                .events()
                .await
                .into_iter()
                .filter_map(|event| match event {
                    MonitoringEvent::CircuitTransition(t) => Some((t.from, t.to)),
                    _ => None,
                })
                .collect();

            let mut expected_from = CircuitState::Closed;
            for (from, to) in transitions {
                prop_assert!(is_legal(from, to), "illegal edge {from} -> {to}");
                prop_assert_eq!(from, expected_from);
                expected_from = to;
            }
            prop_assert_eq!(expected_from, breaker.state().await);
            Ok(())
        })?;
    }

    #[test]
    fn rate_is_zero_below_minimum_samples(failures in 0usize..10) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (breaker, _clock, _events) = breaker(10);

            for _ in 0..failures {
                breaker.record_failure().await;
            }

            let metrics = breaker.metrics().await;
            prop_assert_eq!(metrics.failure_rate, 0.0);
            prop_assert_eq!(metrics.window_failures, failures);
            prop_assert_eq!(breaker.evaluate().await, CircuitState::Closed);
            Ok(())
        })?;
    }

    #[test]
    fn any_half_open_failure_reopens(successes_first in 0u32..=2) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (breaker, clock, _events) = breaker(4);
            for _ in 0..4 {
                breaker.record_failure().await;
            }
            prop_assert_eq!(breaker.evaluate().await, CircuitState::Open);

            clock.advance(Duration::from_secs(30));
            prop_assert_eq!(breaker.evaluate().await, CircuitState::HalfOpen);

            // The trial cap is 3, so at most two successes keep it half-open.
            for _ in 0..successes_first {
                breaker.record_success().await;
            }
            prop_assert_eq!(breaker.state().await, CircuitState::HalfOpen);

            breaker.record_failure().await;
            prop_assert_eq!(breaker.state().await, CircuitState::Open);
            prop_assert_eq!(breaker.metrics().await.trip_count, 2);
            Ok(())
        })?;
    }

    #[test]
    fn sustained_failures_trip_the_breaker(failures in 10usize..150, successes in 0usize..10) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (breaker, _clock, events) = breaker(10);

            for _ in 0..successes {
                breaker.record_success().await;
            }
            for _ in 0..failures {
                breaker.record_failure().await;
            }

            // Failure rate is at least 10/19.
            prop_assert_eq!(breaker.evaluate().await, CircuitState::Open);
            prop_assert!(!breaker.should_allow_request().await);
            prop_assert!(breaker.retry_after().await.is_some());
            prop_assert_eq!(events.circuit_transitions().await, vec![CircuitState::Open]);
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn hundred_failures_open_with_default_config() {
    let clock = TestClock::new();
    let breaker = CircuitBreaker::new(
        CircuitConfig::default(),
        Arc::new(clock),
        RecordingEventHandler::new(),
    );

    for _ in 0..100 {
        breaker.record_failure().await;
    }

    assert_eq!(breaker.evaluate().await, CircuitState::Open);
    assert_eq!(breaker.retry_after().await, Some(30));
    assert!(breaker.check().await.is_err());
}
