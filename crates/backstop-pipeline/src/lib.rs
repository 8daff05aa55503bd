//! Primary processing path with failure protection.
//!
//! This crate consumes the live queue, executes business logic, and decides
//! what happens to messages that fail: re-enqueue with backoff, or route to
//! the dead-letter queue for the recovery worker.
//!
//! # Architecture
//!
//! ```text
//!  live queue ──► PrimaryProcessor ──► MessageHandler
//!                   │        │
//!                   │        ├─ success ─► CircuitBreaker::record_success
//!                   │        │
//!                   │        └─ failure ─► CircuitBreaker::record_failure
//!                   │                      RetryManager::decide
//!                   │                        ├─ RETRY ─────► live queue (delayed)
//!                   │                        └─ ROUTE ─────► DlqRouter ─► DlqStore
//!                   │
//!                   └─ gate: pause flag + CircuitBreaker::check
//! ```
//!
//! The circuit breaker is evaluated by its own periodic task; failures alone
//! never trip it. Only a handler failure counts against the breaker: storage
//! and queue errors are logged and handled separately.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use backstop_pipeline::{CircuitBreaker, CircuitConfig};
//! use backstop_core::{NoOpEventHandler, RealClock};
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new(
//!     CircuitConfig::default(),
//!     Arc::new(RealClock::new()),
//!     Arc::new(NoOpEventHandler::new()),
//! );
//! if breaker.check().await.is_ok() {
//!     breaker.record_success().await;
//! }
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit;
pub mod error;
pub mod handler;
pub mod processor;
pub mod retry;
pub mod router;

pub use circuit::{
    Admission, AlertConfig, CircuitBreaker, CircuitConfig, CircuitEvaluator, CircuitMetrics,
};
pub use error::{PipelineError, Result};
pub use handler::{MessageHandler, SimulatedHandler};
pub use processor::{
    PrimaryProcessor, ProcessOutcome, ProcessorConfig, ProcessorPool, ProcessorStats,
};
pub use retry::{RetryAction, RetryDecision, RetryManager, RetryPolicy, RouteReason};
pub use router::{DlqRouter, RouterConfig, RouterStats};
