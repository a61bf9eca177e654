//! Durable named job queues with retries, stall detection and a read-only
//! board over every queue in the process.

pub mod clock;
pub mod jobs;
pub mod registry;

pub use clock::{Clock, RuntimeClock, SystemClock};
pub use jobs::{
    InMemoryJobStore, Job, JobCounts, JobOutcome, JobQueue, JobStatus, JobStore, Processor,
    QueueConfig, QueueError, QueueEvent, StoreError,
};
pub use registry::{Board, BoardError, QueueAdapter, QueueRegistry, QueueSummary};
