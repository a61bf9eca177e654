//! Core job types and the retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use chatty_core::{DomainError, JobId, JobName, QueueName};

/// Number of executions a job gets before it is marked `failed`.
pub const MAX_ATTEMPTS: u32 = 3;

/// Flat delay between a failed execution and the next dispatch, in milliseconds.
pub const BACKOFF_DELAY_MS: u64 = 5000;

pub const BACKOFF_DELAY: Duration = Duration::from_millis(BACKOFF_DELAY_MS);

/// Job lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, or sitting out a backoff delay (`ready_at` is set)
    Waiting,
    /// Leased by a worker slot and executing
    Active,
    /// Processor signalled success; the record is deleted right after
    Completed,
    /// Attempts exhausted; retained for inspection
    Failed,
    /// Lease expired while active; re-queued without consuming an attempt
    Stalled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Waiting,
        JobStatus::Active,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Stalled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stalled => "stalled",
        }
    }

    /// Whether a worker slot may pick the job up.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Stalled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s:?}")))
    }
}

/// Delay applied before a failed job becomes claimable again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay after every failure (milliseconds)
    Fixed { delay: u64 },
}

/// Retry policy attached to every job.
///
/// The policy is the same for all queues and job names; it is stored on the
/// job so the board shows what the job was submitted with.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total executions allowed, including the first one
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// `{attempts: 3, backoff: {type: fixed, delay: 5000}}`
    pub const STANDARD: RetryPolicy = RetryPolicy {
        attempts: MAX_ATTEMPTS,
        backoff: Backoff::Fixed {
            delay: BACKOFF_DELAY_MS,
        },
    };

    /// Delay before the next dispatch after `attempts_made` failures.
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        if attempts_made == 0 {
            return Duration::ZERO;
        }
        match self.backoff {
            Backoff::Fixed { delay } => Duration::from_millis(delay),
        }
    }

    /// Check if another execution is allowed after `attempts_made` failures.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// Exclusive claim on an active job.
///
/// Transitions out of `active` must present the token; a worker whose lease
/// was recovered as stalled can no longer settle the job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(expires_at: DateTime<Utc>) -> Self {
        Self {
            token: Uuid::new_v4(),
            expires_at,
        }
    }

    /// Same token, later expiry.
    pub fn renewed(&self, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: self.token,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A unit of deferred work owned by one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: QueueName,
    pub name: JobName,
    /// JSON payload (the `data` half of a tagged payload)
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub policy: RetryPolicy,
    /// Failed executions so far
    pub attempts_made: u32,
    pub progress: Option<u8>,
    pub failed_reason: Option<String>,
    pub stalled_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Not claimable before this instant (backoff)
    pub ready_at: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
    pub history: Vec<JobAttemptRecord>,
}

impl Job {
    /// Create a new waiting job with the standard retry policy.
    pub fn new(
        id: JobId,
        queue: QueueName,
        name: JobName,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            queue,
            name,
            payload,
            status: JobStatus::Waiting,
            policy: RetryPolicy::STANDARD,
            attempts_made: 0,
            progress: None,
            failed_reason: None,
            stalled_count: 0,
            created_at: now,
            updated_at: now,
            ready_at: None,
            lease: None,
            history: Vec::new(),
        }
    }

    /// 1-based number of the execution currently running (or about to run).
    pub fn attempt(&self) -> u32 {
        self.attempts_made + 1
    }

    pub fn lease_token(&self) -> Option<Uuid> {
        self.lease.map(|l| l.token)
    }

    /// Rebuild a tagged payload (see [`crate::jobs::payload`]).
    pub fn decode<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        crate::jobs::payload::decode(&self.name, &self.payload)
    }

    /// Mark job as leased by a worker slot.
    pub fn mark_active(&mut self, lease: Lease, now: DateTime<Utc>) {
        self.status = JobStatus::Active;
        self.lease = Some(lease);
        self.ready_at = None;
        self.updated_at = now;
    }

    /// Mark job as completed.
    pub fn mark_completed(
        &mut self,
        progress: Option<u8>,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.status = JobStatus::Completed;
        self.lease = None;
        if progress.is_some() {
            self.progress = progress;
        }
        self.updated_at = now;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt(),
            started_at,
            finished_at: now,
            success: true,
            error: None,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    /// Record a failed execution and decide between retry and terminal failure.
    ///
    /// Returns the backoff delay when the job goes back to `waiting`, `None`
    /// when attempts are exhausted and the job is now `failed`.
    pub fn mark_failed(
        &mut self,
        reason: String,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        self.history.push(JobAttemptRecord {
            attempt: self.attempt(),
            started_at,
            finished_at: now,
            success: false,
            error: Some(reason.clone()),
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
        self.attempts_made += 1;
        self.lease = None;
        self.failed_reason = Some(reason);
        self.updated_at = now;

        if self.policy.should_retry(self.attempts_made) {
            let delay = self.policy.delay_for_attempt(self.attempts_made);
            self.status = JobStatus::Waiting;
            self.ready_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            Some(delay)
        } else {
            self.status = JobStatus::Failed;
            self.ready_at = None;
            None
        }
    }

    /// Mark job as stalled (lease expired); attempts are left untouched.
    pub fn mark_stalled(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Stalled;
        self.stalled_count += 1;
        self.lease = None;
        self.updated_at = now;
    }
}

/// Completion signal returned by a processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Job completed successfully, optionally reporting progress (0-100)
    Completed { progress: Option<u8> },
    /// Job failed; the reason is logged and kept on the job
    Failed { reason: String },
}

impl JobOutcome {
    pub fn completed() -> Self {
        Self::Completed { progress: None }
    }

    /// Success with a progress percentage, clamped to 100.
    pub fn with_progress(progress: u8) -> Self {
        Self::Completed {
            progress: Some(progress.min(100)),
        }
    }

    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed {
            reason: reason.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed { .. })
    }
}

impl<E: std::fmt::Display> From<Result<(), E>> for JobOutcome {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => JobOutcome::completed(),
            Err(e) => JobOutcome::failed(e),
        }
    }
}
