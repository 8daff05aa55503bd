//! Backstop: failure handling for message pipelines.
//!
//! A circuit breaker and retry manager guard the primary processing path,
//! exhausted messages land in a persistent dead-letter queue, and a
//! background worker classifies and recovers them.

pub mod config;
pub mod service;

pub use config::Config;
pub use service::{Service, ServiceParts};
