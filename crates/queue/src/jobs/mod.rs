//! Background jobs: named work items with a fixed retry policy.
//!
//! ## Lifecycle
//!
//! - `submit` stores a `waiting` job and returns its id
//! - a worker slot claims it (`active`, leased) and runs the processor
//! - success deletes the job
//! - failure puts it back to `waiting` for 5000 ms, up to 3 executions in
//!   total, after which it stays `failed` for inspection
//! - an expired lease marks the job `stalled` and re-queues it
//!
//! ## Components
//!
//! - `Job`: job record with payload, attempts and history
//! - `JobStore`: persistence (in-memory, or Redis with the `redis` feature)
//! - `JobQueue`: submission, processor registration and dispatch

pub mod executor;
pub mod payload;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;
pub mod types;

pub use executor::{JobQueue, Processor, QueueConfig, QueueError, QueueEvent};
pub use payload::PayloadError;
#[cfg(feature = "redis")]
pub use redis_store::RedisJobStore;
pub use store::{InMemoryJobStore, JobCounts, JobStore, StoreError};
pub use types::{
    BACKOFF_DELAY, Backoff, Job, JobAttemptRecord, JobOutcome, JobStatus, Lease, MAX_ATTEMPTS,
    RetryPolicy,
};
