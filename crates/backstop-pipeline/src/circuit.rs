//! Circuit breaker guarding the primary processing path.
//!
//! A single breaker is shared by every processor in the process. It keeps a
//! time-bounded window of outcomes and trips when the failure rate over that
//! window crosses a threshold, then probes recovery with a bounded number of
//! trial requests.
//!
//! # State Machine
//!
//! ```text
//!                   ┌──────────────────────────┐
//!                   │          CLOSED          │
//!                   │ ● all requests allowed   │
//!                   │ ● window failure rate    │
//!                   └──────────────────────────┘
//!                     │                      ▲
//!   rate >= threshold │                      │ trial success rate
//!   and enough samples│                      │ >= success threshold
//!   (evaluator tick)  ▼                      │
//!   ┌──────────────────────┐  open timeout  ┌──────────────────────┐
//!   │         OPEN         │ ─────────────▶ │      HALF-OPEN       │
//!   │ ● requests blocked   │ (evaluator)    │ ● up to N trials     │
//!   │ ● retry-after        │ ◀───────────── │ ● any failure reopens│
//!   └──────────────────────┘                └──────────────────────┘
//! ```
//!
//! No other edges exist. Closed and open transitions happen on the evaluator
//! tick ([`CircuitBreaker::spawn_evaluator`]); half-open decisions also
//! happen eagerly on every trial outcome.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use backstop_core::{
    backoff::format_duration,
    events::{CircuitTransitionEvent, EventHandler, MonitoringEvent, TransitionKind},
    CircuitState, Clock,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};

/// Which transitions reach the monitoring sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Master switch; when off no transition is reported.
    pub enabled: bool,
    /// Report transitions into open.
    pub on_trip: bool,
    /// Report transitions into closed.
    pub on_close: bool,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self { enabled: true, on_trip: true, on_close: true }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Failure rate (0.0 to 1.0) at which a closed circuit trips.
    pub failure_threshold: f64,
    /// Width of the sliding window.
    pub window: Duration,
    /// Samples required before the failure rate counts.
    pub minimum_requests: usize,
    /// Time spent open before probing.
    pub open_timeout: Duration,
    /// Trial requests allowed while half-open.
    pub half_open_max_requests: u32,
    /// Trial success rate (0.0 to 1.0) needed to close.
    pub half_open_success_threshold: f64,
    /// Evaluator tick.
    pub evaluation_interval: Duration,
    /// Alert gating.
    pub alerts: AlertConfig,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            window: Duration::from_secs(60),
            minimum_requests: 10,
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 3,
            half_open_success_threshold: 0.6,
            evaluation_interval: Duration::from_secs(5),
            alerts: AlertConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy)]
struct WindowEvent {
    at: Instant,
    outcome: Outcome,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    last_transition: Instant,
    last_transition_utc: DateTime<Utc>,
    window: VecDeque<WindowEvent>,
    half_open_successes: u32,
    half_open_failures: u32,
    /// Admitted half-open trials with no outcome yet.
    half_open_in_flight: u32,
    /// Bumped on every entry into half-open.
    half_open_epoch: u64,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    trip_count: u64,
}

impl BreakerState {
    fn new(now: Instant, now_utc: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            last_transition: now,
            last_transition_utc: now_utc,
            window: VecDeque::new(),
            half_open_successes: 0,
            half_open_failures: 0,
            half_open_in_flight: 0,
            half_open_epoch: 0,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            trip_count: 0,
        }
    }

    /// Drops events at least `width` old.
    fn prune(&mut self, now: Instant, width: Duration) {
        while self.window.front().is_some_and(|e| now.saturating_duration_since(e.at) >= width) {
            self.window.pop_front();
        }
    }

    fn window_failures(&self) -> usize {
        self.window.iter().filter(|e| e.outcome == Outcome::Failure).count()
    }

    /// Zero below `minimum` samples.
    fn failure_rate(&self, minimum: usize) -> f64 {
        if self.window.is_empty() || self.window.len() < minimum {
            return 0.0;
        }
        self.window_failures() as f64 / self.window.len() as f64
    }

    fn half_open_trials(&self) -> u32 {
        self.half_open_successes + self.half_open_failures
    }

    /// Finished plus in-flight trials.
    fn half_open_used(&self) -> u32 {
        self.half_open_trials() + self.half_open_in_flight
    }

    fn retry_after(&self, now: Instant, open_timeout: Duration) -> Option<u64> {
        if self.state != CircuitState::Open {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.last_transition);
        let remaining = open_timeout.saturating_sub(elapsed);
        Some(u64::try_from(remaining.as_millis().div_ceil(1000)).unwrap_or(u64::MAX))
    }
}

/// Permission to send one request, taken by [`CircuitBreaker::check`].
///
/// While half-open it holds one of the trial slots until an outcome is
/// recorded or it is handed back with [`CircuitBreaker::release`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    half_open_epoch: Option<u64>,
}

impl Admission {
    /// Returns true when this admission holds a half-open trial slot.
    pub fn is_trial(&self) -> bool {
        self.half_open_epoch.is_some()
    }
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitMetrics {
    /// Current state.
    pub state: CircuitState,
    /// Failure rate over the window; zero below the sample minimum.
    pub failure_rate: f64,
    /// Events in the window.
    pub window_size: usize,
    /// Failures in the window.
    pub window_failures: usize,
    /// Successes in the window.
    pub window_successes: usize,
    /// Outcomes recorded since creation or the last reset.
    pub total_requests: u64,
    /// Successes recorded since creation or the last reset.
    pub total_successes: u64,
    /// Failures recorded since creation or the last reset.
    pub total_failures: u64,
    /// Transitions into open since creation or the last reset.
    pub trip_count: u64,
    /// Trial successes in the current half-open episode.
    pub half_open_successes: u32,
    /// Trial failures in the current half-open episode.
    pub half_open_failures: u32,
    /// When the state last changed.
    pub last_state_change: DateTime<Utc>,
    /// Time spent in the current state.
    pub time_in_state: Duration,
}

impl CircuitMetrics {
    /// Time in state rendered as e.g. `"4m 12s"`.
    pub fn time_in_state_display(&self) -> String {
        format_duration(self.time_in_state)
    }
}

/// Process-wide breaker over the primary path.
///
/// Construct once in the composition root and share through `Arc`.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventHandler>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>, events: Arc<dyn EventHandler>) -> Self {
        let inner = Mutex::new(BreakerState::new(clock.now(), clock.now_utc()));
        Self { config, clock, events, inner }
    }

    /// Configuration in use.
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Current state.
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Records a successful request.
    ///
    /// While half-open, the trial is counted and the episode is decided as
    /// soon as the trial cap is reached.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn record_success(&self) {
        let event = {
            let mut inner = self.inner.lock().await;
            self.record(&mut inner, Outcome::Success);
            inner.total_successes += 1;

            if inner.state == CircuitState::HalfOpen {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                self.decide_half_open(&mut inner)
            } else {
                None
            }
        };
        self.dispatch(event).await;
    }

    /// Records a failed request. Any failure while half-open reopens the
    /// circuit immediately.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn record_failure(&self) {
        let event = {
            let mut inner = self.inner.lock().await;
            self.record(&mut inner, Outcome::Failure);
            inner.total_failures += 1;

            if inner.state == CircuitState::HalfOpen {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_failures += 1;
                self.transition(&mut inner, CircuitState::Open)
            } else {
                None
            }
        };
        self.dispatch(event).await;
    }

    /// Runs one evaluation and returns the resulting state.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn evaluate(&self) -> CircuitState {
        let (state, event) = {
            let mut inner = self.inner.lock().await;
            let now = self.clock.now();
            inner.prune(now, self.config.window);

            let event = match inner.state {
                CircuitState::Closed => {
                    let rate = inner.failure_rate(self.config.minimum_requests);
                    let enough = inner.window.len() >= self.config.minimum_requests;
                    if enough && rate >= self.config.failure_threshold {
                        self.transition(&mut inner, CircuitState::Open)
                    } else {
                        None
                    }
                },
                CircuitState::Open => {
                    if now.saturating_duration_since(inner.last_transition)
                        >= self.config.open_timeout
                    {
                        self.transition(&mut inner, CircuitState::HalfOpen)
                    } else {
                        None
                    }
                },
                CircuitState::HalfOpen => self.decide_half_open(&mut inner),
            };
            (inner.state, event)
        };
        self.dispatch(event).await;
        state
    }

    /// Returns true when a request may proceed. Takes no trial slot.
    ///
    /// Closed always allows, open never does, half-open allows while the
    /// trial cap has not been reached.
    pub async fn should_allow_request(&self) -> bool {
        let inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => inner.half_open_used() < self.config.half_open_max_requests,
        }
    }

    /// Admits one request or fails with [`PipelineError::CircuitOpen`].
    ///
    /// While half-open the admission takes a trial slot under the same lock
    /// as the cap check, so concurrent callers never exceed the cap.
    ///
    /// # Errors
    ///
    /// Returns error if the breaker does not allow a request right now.
    pub async fn check(&self) -> Result<Admission> {
        let mut inner = self.inner.lock().await;
        let cap = self.config.half_open_max_requests;
        match inner.state {
            CircuitState::Closed => Ok(Admission { half_open_epoch: None }),
            CircuitState::HalfOpen if inner.half_open_used() < cap => {
                inner.half_open_in_flight += 1;
                Ok(Admission { half_open_epoch: Some(inner.half_open_epoch) })
            },
            CircuitState::HalfOpen => Err(PipelineError::circuit_open(None)),
            CircuitState::Open => Err(PipelineError::circuit_open(
                inner.retry_after(self.clock.now(), self.config.open_timeout),
            )),
        }
    }

    /// Hands back an admission that was never used for a request.
    ///
    /// A no-op outside half-open, and for slots taken in an earlier
    /// half-open episode.
    pub async fn release(&self, admission: Admission) {
        let Some(epoch) = admission.half_open_epoch else {
            return;
        };
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::HalfOpen && inner.half_open_epoch == epoch {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Whole seconds until the open timeout elapses, rounded up. `None`
    /// unless open.
    pub async fn retry_after(&self) -> Option<u64> {
        let inner = self.inner.lock().await;
        inner.retry_after(self.clock.now(), self.config.open_timeout)
    }

    /// Snapshot of counters and state.
    pub async fn metrics(&self) -> CircuitMetrics {
        let mut inner = self.inner.lock().await;
        let now = self.clock.now();
        inner.prune(now, self.config.window);
        let window_failures = inner.window_failures();

        CircuitMetrics {
            state: inner.state,
            failure_rate: inner.failure_rate(self.config.minimum_requests),
            window_size: inner.window.len(),
            window_failures,
            window_successes: inner.window.len() - window_failures,
            total_requests: inner.total_requests,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            trip_count: inner.trip_count,
            half_open_successes: inner.half_open_successes,
            half_open_failures: inner.half_open_failures,
            last_state_change: inner.last_transition_utc,
            time_in_state: now.saturating_duration_since(inner.last_transition),
        }
    }

    /// Moves to `state` regardless of the usual edges. Admin use.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn force_state(&self, state: CircuitState) {
        let event = {
            let mut inner = self.inner.lock().await;
            warn!(from = %inner.state, to = %state, "forcing circuit breaker state");
            Some(self.apply(&mut inner, state))
        };
        self.dispatch(event).await;
    }

    /// Clears the window and lifetime counters. The state is untouched.
    pub async fn reset_metrics(&self) {
        let mut inner = self.inner.lock().await;
        inner.window.clear();
        inner.total_requests = 0;
        inner.total_successes = 0;
        inner.total_failures = 0;
        inner.trip_count = 0;
        info!("circuit breaker metrics reset");
    }

    /// Starts the evaluator task.
    ///
    /// The task runs [`evaluate`](Self::evaluate) every evaluation interval
    /// until `token` is cancelled.
    pub fn spawn_evaluator(self: &Arc<Self>, token: CancellationToken) -> CircuitEvaluator {
        let breaker = Arc::clone(self);
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            info!(
                interval_ms = breaker.config.evaluation_interval.as_millis(),
                "circuit breaker evaluator started"
            );
            loop {
                tokio::select! {
                    () = breaker.clock.sleep(breaker.config.evaluation_interval) => {
                        breaker.evaluate().await;
                    }
                    () = task_token.cancelled() => break,
                }
            }
            info!("circuit breaker evaluator stopped");
        });

        CircuitEvaluator { token, handle }
    }

    fn record(&self, inner: &mut BreakerState, outcome: Outcome) {
        let now = self.clock.now();
        inner.window.push_back(WindowEvent { at: now, outcome });
        inner.prune(now, self.config.window);
        inner.total_requests += 1;
    }

    fn decide_half_open(&self, inner: &mut BreakerState) -> Option<CircuitTransitionEvent> {
        let trials = inner.half_open_trials();
        if trials < self.config.half_open_max_requests || trials == 0 {
            return None;
        }
        let success_rate = f64::from(inner.half_open_successes) / f64::from(trials);
        let target = if success_rate >= self.config.half_open_success_threshold {
            CircuitState::Closed
        } else {
            CircuitState::Open
        };
        self.transition(inner, target)
    }

    /// Applies `to` if it is a legal edge from the current state.
    fn transition(
        &self,
        inner: &mut BreakerState,
        to: CircuitState,
    ) -> Option<CircuitTransitionEvent> {
        if !inner.state.can_transition_to(to) {
            debug!(from = %inner.state, to = %to, "ignoring illegal circuit transition");
            return None;
        }
        Some(self.apply(inner, to))
    }

    fn apply(&self, inner: &mut BreakerState, to: CircuitState) -> CircuitTransitionEvent {
        let from = inner.state;
        let failure_rate = inner.failure_rate(self.config.minimum_requests);
        let sample_count = inner.window.len();

        inner.state = to;
        inner.last_transition = self.clock.now();
        inner.last_transition_utc = self.clock.now_utc();

        inner.half_open_in_flight = 0;
        match to {
            CircuitState::Open => inner.trip_count += 1,
            CircuitState::HalfOpen => {
                inner.half_open_successes = 0;
                inner.half_open_failures = 0;
                inner.half_open_epoch += 1;
            },
            CircuitState::Closed => {
                inner.window.clear();
                inner.half_open_successes = 0;
                inner.half_open_failures = 0;
            },
        }

        info!(%from, %to, failure_rate, sample_count, "circuit breaker state transition");

        CircuitTransitionEvent {
            from,
            to,
            kind: TransitionKind::for_target(to),
            failure_rate,
            sample_count,
            occurred_at: inner.last_transition_utc,
        }
    }

    async fn dispatch(&self, event: Option<CircuitTransitionEvent>) {
        let Some(event) = event else {
            return;
        };
        let alerts = self.config.alerts;
        let wanted = alerts.enabled
            && match event.to {
                CircuitState::Open => alerts.on_trip,
                CircuitState::Closed => alerts.on_close,
                CircuitState::HalfOpen => true,
            };
        if wanted {
            self.events.handle_event(MonitoringEvent::CircuitTransition(event)).await;
        }
    }
}

/// Handle to a running evaluator task.
#[derive(Debug)]
pub struct CircuitEvaluator {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl CircuitEvaluator {
    /// Returns true while the task is running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stops the evaluator and waits for it to exit.
    ///
    /// # Errors
    ///
    /// Returns error if the task panicked.
    pub async fn shutdown(self) -> Result<()> {
        self.token.cancel();
        self.handle
            .await
            .map_err(|e| PipelineError::WorkerPanic { message: e.to_string() })
    }
}
