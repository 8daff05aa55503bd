//! Core domain types, storage, and shared primitives.
//!
//! Provides the dead-letter record model, failure classification, backoff
//! arithmetic, monitoring events, the live queue, and the DLQ store used by
//! the primary processor and the DLQ worker.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod classify;
pub mod error;
pub mod events;
pub mod models;
pub mod queue;
pub mod storage;
pub mod system;
pub mod time;

pub use classify::{
    classify, recommended_action, ClassificationTable, ErrorClass, ErrorSignal, ErrorStatistics,
    FailureCategory,
};
pub use error::{CoreError, Result};
pub use events::{
    CircuitTransitionEvent, DeadLetterFailedEvent, DeadLetteredEvent, EventHandler,
    MonitoringEvent, MulticastEventHandler, NoOpEventHandler, TracingEventHandler, TransitionKind,
};
pub use models::{
    CircuitState, DlqId, DlqMessage, DlqStats, DlqStatus, ErrorTypeCount, LastError,
    MessageMetadata, QueueEnvelope, RecoveryStrategy, ReplayAttempt, ReplayOutcome,
    RetryHistoryEntry, SystemState, DEFAULT_PRIORITY, DLQ_RETRY_TAG,
};
pub use queue::{Delivery, LiveQueue, MemoryQueue, PostgresQueue, Receipt};
pub use storage::{
    memory::{InMemoryDlqStore, StoreOperation},
    ClosingUpdate, DlqStore, FailureUpdate, PostgresDlqStore, Storage, StoreFuture,
};
pub use system::{ProcfsProbe, SystemProbe};
pub use time::{Clock, RealClock, TestClock};
