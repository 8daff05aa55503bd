//! DLQ recovery worker.
//!
//! Picks up dead-lettered messages once they are due, decides what can be
//! done about them, and does it:
//!
//! ```text
//!  loop:
//!    clear_stale_locks(now - lock_timeout)
//!    batch = find_pending(batch_size)
//!    for message in batch (sequentially):
//!      acquire_lock ── lost ──► skip
//!        │
//!      select_strategy
//!        ├─ TEMPORARY  ─► IMMEDIATE_RETRY / SCHEDULED_RETRY ─► live queue + PENDING
//!        ├─ PERMANENT  ─► MARK_AS_FAILED                    ─► FAILED
//!        ├─ MANUAL     ─► MANUAL_INTERVENTION               ─► MANUAL
//!        └─ budget out ─► MARK_AS_FAILED                    ─► FAILED
//!    sleep(poll_interval)
//! ```
//!
//! Correctness across several workers rests on the store's conditional
//! lock updates, not on anything in this process.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod classifier;
pub mod config;
pub mod error;
pub mod operator;
pub mod orchestrator;
pub mod strategy;

pub use classifier::{select_strategy, StrategySelection};
pub use config::WorkerConfig;
pub use error::{Result, WorkerError};
pub use operator::{OperatorActions, ReplayReceipt};
pub use orchestrator::{
    generate_worker_id, BatchReport, MessageResult, WorkerHandle, WorkerOrchestrator, WorkerStats,
};
pub use strategy::{replay_envelope, StrategyExecutor, StrategyOutcome};
