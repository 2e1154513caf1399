//! callforge: outbound voice-campaign scheduling and execution.
//!
//! This library provides the campaign job queue and worker pipeline:
//! durable per-campaign queues, a seven-stage call pipeline with budget
//! and consent gating, categorized retries, and a drainable worker
//! lifecycle.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod lifecycle;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod scripts;
pub mod telephony;

// Re-export commonly used error types
pub use config::ConfigError;
pub use error::{FailureKind, PipelineError};
pub use gateway::GatewayError;
pub use scheduler::{PoolError, QueueError};
pub use scripts::ScriptError;
pub use telephony::TelephonyError;
