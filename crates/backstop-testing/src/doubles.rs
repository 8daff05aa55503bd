//! Test doubles for the pipeline's collaborators.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use backstop_core::{
    CircuitState, ErrorSignal, EventHandler, MonitoringEvent, QueueEnvelope, SystemProbe,
    SystemState,
};
use backstop_pipeline::MessageHandler;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::RwLock;

/// Event handler that keeps every event it sees.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: RwLock<Vec<MonitoringEvent>>,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every event so far, oldest first.
    pub async fn events(&self) -> Vec<MonitoringEvent> {
        self.events.read().await.clone()
    }

    /// Target states of the circuit transitions seen so far.
    pub async fn circuit_transitions(&self) -> Vec<CircuitState> {
        self.events
            .read()
            .await
            .iter()
            .filter_map(|event| match event {
                MonitoringEvent::CircuitTransition(transition) => Some(transition.to),
                _ => None,
            })
            .collect()
    }

    /// Message ids reported as dead-lettered.
    pub async fn dead_lettered(&self) -> Vec<String> {
        self.events
            .read()
            .await
            .iter()
            .filter_map(|event| match event {
                MonitoringEvent::DeadLettered(routed) => Some(routed.message_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Message ids the DLQ failed to take.
    pub async fn dead_letter_failures(&self) -> Vec<String> {
        self.events
            .read()
            .await
            .iter()
            .filter_map(|event| match event {
                MonitoringEvent::DeadLetterFailed(failed) => Some(failed.message_id.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: MonitoringEvent) {
        self.events.write().await.push(event);
    }
}

/// Probe returning a fixed snapshot.
#[derive(Debug, Clone)]
pub struct StaticProbe {
    state: SystemState,
}

impl StaticProbe {
    /// Probe reporting 25% CPU and 50% of 8 GB memory at `captured_at`.
    pub fn new(captured_at: DateTime<Utc>) -> Self {
        Self {
            state: SystemState {
                cpu_usage: 0.25,
                memory_usage: 0.5,
                total_memory_mb: 8192,
                used_memory_mb: 4096,
                uptime_seconds: 120.0,
                captured_at,
            },
        }
    }
}

impl SystemProbe for StaticProbe {
    fn capture(&self) -> SystemState {
        self.state.clone()
    }
}

/// Handler whose results are scripted per message id.
///
/// Each call pops the next scripted result for the envelope's message id.
/// With nothing scripted, the fallback applies: success, or the signal set
/// with [`fail_by_default`](Self::fail_by_default).
#[derive(Debug, Default)]
pub struct ScriptedHandler {
    scripts: RwLock<HashMap<String, VecDeque<Result<Value, ErrorSignal>>>>,
    fallback: RwLock<Option<ErrorSignal>>,
    calls: AtomicUsize,
    seen: RwLock<Vec<QueueEnvelope>>,
}

impl ScriptedHandler {
    /// Creates a handler that succeeds on everything.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues `count` failures with `signal` for `message_id`.
    pub async fn fail(&self, message_id: &str, signal: ErrorSignal, count: usize) {
        let mut scripts = self.scripts.write().await;
        let script = scripts.entry(message_id.to_string()).or_default();
        script.extend(std::iter::repeat_n(Err(signal), count));
    }

    /// Queues one success for `message_id`.
    pub async fn succeed(&self, message_id: &str) {
        self.scripts
            .write()
            .await
            .entry(message_id.to_string())
            .or_default()
            .push_back(Ok(json!({ "processed": true })));
    }

    /// Fails every unscripted call with `signal`.
    pub async fn fail_by_default(&self, signal: ErrorSignal) {
        *self.fallback.write().await = Some(signal);
    }

    /// Succeeds on every unscripted call again.
    pub async fn succeed_by_default(&self) {
        *self.fallback.write().await = None;
    }

    /// Number of calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    /// Every envelope handled, in call order.
    pub async fn seen(&self) -> Vec<QueueEnvelope> {
        self.seen.read().await.clone()
    }
}

#[async_trait::async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(&self, envelope: &QueueEnvelope) -> Result<Value, ErrorSignal> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        self.seen.write().await.push(envelope.clone());

        let scripted = self
            .scripts
            .write()
            .await
            .get_mut(&envelope.message_id)
            .and_then(VecDeque::pop_front);
        if let Some(result) = scripted {
            return result;
        }

        match self.fallback.read().await.clone() {
            Some(signal) => Err(signal),
            None => Ok(json!({ "processed": true, "messageId": envelope.message_id })),
        }
    }
}
