//! Test infrastructure for deterministic pipeline tests.
//!
//! Provides record and envelope builders, recording doubles for the
//! pipeline's collaborators, and a [`TestEnv`] that wires the breaker,
//! router, processor and DLQ worker over in-memory storage and a manually
//! driven clock.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod doubles;
pub mod env;
pub mod fixtures;

pub use backstop_core::TestClock;
pub use doubles::{RecordingEventHandler, ScriptedHandler, StaticProbe};
pub use env::{TestEnv, TestEnvBuilder};
pub use fixtures::{DlqMessageBuilder, EnvelopeBuilder};
