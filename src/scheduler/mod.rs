//! Durable campaign queues and the worker pool consuming them.
//!
//! This module provides the distributed execution layer:
//!
//! - **CampaignQueue**: one Redis-backed durable queue per campaign type
//! - **WorkerPool**: bounded-concurrency consumers over all queues
//! - **CampaignJob**: job definitions with attempt accounting
//!
//! # Architecture
//!
//! ```text
//!                 ┌───────────────┐
//!                 │   Scheduler   │
//!                 │  (API / CLI)  │
//!                 └───────┬───────┘
//!                         │ enqueue
//!        ┌────────────────┼────────────────┐
//!        ▼                ▼                ▼
//!  calls:review_…   calls:reactivation   … (5 queues in Redis)
//!        │                │                │
//!        └───────┬────────┴───────┬────────┘
//!                ▼                ▼
//!          ┌──────────┐     ┌──────────┐
//!          │ Worker 1 │     │ Worker N │   (one consumer group per
//!          └──────────┘     └──────────┘    queue, per process)
//! ```
//!
//! # Reliability
//!
//! - Atomic claims via BRPOPLPUSH; no two workers hold the same job
//! - Exponential retry backoff through a delayed sorted set
//! - Stalled claims are swept back onto the queue, bounded by a
//!   redelivery ceiling
//! - Permanent failures short-circuit to a bounded failed history

pub mod job;
pub mod queue;
pub mod worker_pool;

pub use job::{CallOutcome, CampaignJob, CampaignType, EnqueueOptions, VoiceConfig};
pub use queue::{backoff_delay, CampaignQueue, QueueDepths, QueueError};
pub use worker_pool::{
    PoolError, PoolStats, WorkerEvent, WorkerPool, WorkerPoolConfig,
};
