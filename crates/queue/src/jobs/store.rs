//! Job storage: the backing-store contract and the in-memory implementation.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use chatty_core::{JobId, JobName, QueueName};

use super::types::{Job, JobStatus, Lease};

/// Backing store for queues.
///
/// Every state transition is atomic per job; the dispatcher does no locking of
/// its own. Operations that move a job out of `active` take the lease token and
/// return `false` when the caller no longer holds the lease.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Identity of the underlying store; two handles on the same store report
    /// the same value.
    fn instance_id(&self) -> &str;

    /// Allocate the next job id for a queue.
    async fn next_id(&self, queue: &QueueName) -> Result<JobId, StoreError>;

    /// Persist a new `waiting` job at the back of its job name's order.
    async fn enqueue(&self, queue: &QueueName, job: &Job) -> Result<(), StoreError>;

    /// Promote due delayed jobs, then lease the oldest claimable job for `name`.
    async fn claim(
        &self,
        queue: &QueueName,
        name: &JobName,
        now: DateTime<Utc>,
        lease: Lease,
    ) -> Result<Option<Job>, StoreError>;

    /// Extend a lease. `lease.token` must match the held lease.
    async fn renew(&self, queue: &QueueName, id: JobId, lease: &Lease) -> Result<bool, StoreError>;

    /// Delete an active job after its processor succeeded.
    async fn complete(&self, queue: &QueueName, id: JobId, token: Uuid) -> Result<bool, StoreError>;

    /// Persist a failed execution: `waiting` with a `ready_at` (delayed) or
    /// terminally `failed`.
    async fn settle(&self, queue: &QueueName, job: &Job, token: Uuid) -> Result<bool, StoreError>;

    /// Re-queue active jobs whose lease expired, marking them `stalled`.
    async fn recover_stalled(
        &self,
        queue: &QueueName,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Get a job by ID.
    async fn get(&self, queue: &QueueName, id: JobId) -> Result<Option<Job>, StoreError>;

    /// List jobs, oldest first, optionally filtered by status.
    async fn list(
        &self,
        queue: &QueueName,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Count jobs per status.
    async fn counts(&self, queue: &QueueName) -> Result<JobCounts, StoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Job statistics for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub stalled: usize,
}

impl JobCounts {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Waiting => self.waiting += 1,
            JobStatus::Active => self.active += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Stalled => self.stalled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.waiting + self.active + self.completed + self.failed + self.stalled
    }
}

#[derive(Debug, Default)]
struct QueueState {
    last_id: u64,
    jobs: HashMap<JobId, Job>,
    waiting: HashMap<JobName, VecDeque<JobId>>,
    delayed: BTreeSet<(DateTime<Utc>, JobId)>,
}

impl QueueState {
    fn push_waiting(&mut self, name: &JobName, id: JobId) {
        self.waiting.entry(name.clone()).or_default().push_back(id);
    }

    /// Move every delayed job that is due to the back of its waiting order.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(&(ready_at, id)) = self.delayed.first() {
            if ready_at > now {
                break;
            }
            self.delayed.pop_first();
            if let Some(name) = self.jobs.get(&id).map(|j| j.name.clone()) {
                self.push_waiting(&name, id);
            }
        }
    }

    fn active_with_token(&mut self, id: JobId, token: Uuid) -> Option<&mut Job> {
        self.jobs
            .get_mut(&id)
            .filter(|j| j.status == JobStatus::Active && j.lease_token() == Some(token))
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore {
    instance_id: String,
    queues: Mutex<HashMap<QueueName, QueueState>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            instance_id: format!("memory:{}", Uuid::new_v4()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<QueueName, QueueState>>, StoreError> {
        self.queues.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn next_id(&self, queue: &QueueName) -> Result<JobId, StoreError> {
        let mut queues = self.lock()?;
        let state = queues.entry(queue.clone()).or_default();
        state.last_id += 1;
        Ok(JobId::new(state.last_id))
    }

    async fn enqueue(&self, queue: &QueueName, job: &Job) -> Result<(), StoreError> {
        let mut queues = self.lock()?;
        let state = queues.entry(queue.clone()).or_default();
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        state.jobs.insert(job.id, job.clone());
        state.push_waiting(&job.name, job.id);
        Ok(())
    }

    async fn claim(
        &self,
        queue: &QueueName,
        name: &JobName,
        now: DateTime<Utc>,
        lease: Lease,
    ) -> Result<Option<Job>, StoreError> {
        let mut queues = self.lock()?;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };
        state.promote_due(now);

        while let Some(id) = state.waiting.get_mut(name).and_then(VecDeque::pop_front) {
            if let Some(job) = state.jobs.get_mut(&id) {
                if job.status.is_claimable() {
                    job.mark_active(lease, now);
                    return Ok(Some(job.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn renew(&self, queue: &QueueName, id: JobId, lease: &Lease) -> Result<bool, StoreError> {
        let mut queues = self.lock()?;
        let Some(job) = queues
            .get_mut(queue)
            .and_then(|s| s.active_with_token(id, lease.token))
        else {
            return Ok(false);
        };
        job.lease = Some(*lease);
        Ok(true)
    }

    async fn complete(&self, queue: &QueueName, id: JobId, token: Uuid) -> Result<bool, StoreError> {
        let mut queues = self.lock()?;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(false);
        };
        if state.active_with_token(id, token).is_none() {
            return Ok(false);
        }
        state.jobs.remove(&id);
        Ok(true)
    }

    async fn settle(&self, queue: &QueueName, job: &Job, token: Uuid) -> Result<bool, StoreError> {
        let mut queues = self.lock()?;
        let Some(state) = queues.get_mut(queue) else {
            return Err(StoreError::NotFound(job.id));
        };
        if state.active_with_token(job.id, token).is_none() {
            return Ok(false);
        }

        state.jobs.insert(job.id, job.clone());
        if job.status.is_claimable() {
            match job.ready_at {
                Some(ready_at) => {
                    state.delayed.insert((ready_at, job.id));
                }
                None => state.push_waiting(&job.name, job.id),
            }
        }
        Ok(true)
    }

    async fn recover_stalled(
        &self,
        queue: &QueueName,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut queues = self.lock()?;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let mut expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Active && j.lease.is_none_or(|lease| lease.is_expired(now))
            })
            .map(|j| j.id)
            .collect();
        expired.sort();

        let mut stalled = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.mark_stalled(now);
                stalled.push(job.clone());
            }
        }
        for job in &stalled {
            state.push_waiting(&job.name, job.id);
        }
        Ok(stalled)
    }

    async fn get(&self, queue: &QueueName, id: JobId) -> Result<Option<Job>, StoreError> {
        let queues = self.lock()?;
        Ok(queues.get(queue).and_then(|s| s.jobs.get(&id)).cloned())
    }

    async fn list(
        &self,
        queue: &QueueName,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let queues = self.lock()?;
        let Some(state) = queues.get(queue) else {
            return Ok(Vec::new());
        };
        let mut result: Vec<_> = state
            .jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| j.id);
        result.truncate(limit);
        Ok(result)
    }

    async fn counts(&self, queue: &QueueName) -> Result<JobCounts, StoreError> {
        let queues = self.lock()?;
        let mut counts = JobCounts::default();
        if let Some(state) = queues.get(queue) {
            for job in state.jobs.values() {
                counts.record(job.status);
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> QueueName {
        QueueName::new("authQueue").unwrap()
    }

    fn name(s: &str) -> JobName {
        JobName::new(s).unwrap()
    }

    fn lease(now: DateTime<Utc>) -> Lease {
        Lease::new(now + chrono::Duration::seconds(30))
    }

    async fn submit(store: &InMemoryJobStore, job_name: &str, now: DateTime<Utc>) -> JobId {
        let id = store.next_id(&queue()).await.unwrap();
        let job = Job::new(id, queue(), name(job_name), serde_json::json!({}), now);
        store.enqueue(&queue(), &job).await.unwrap();
        id
    }

    #[tokio::test]
    async fn ids_are_monotonic_per_queue() {
        let store = InMemoryJobStore::new();
        let other = QueueName::new("emailQueue").unwrap();

        assert_eq!(store.next_id(&queue()).await.unwrap(), JobId::new(1));
        assert_eq!(store.next_id(&queue()).await.unwrap(), JobId::new(2));
        assert_eq!(store.next_id(&other).await.unwrap(), JobId::new(1));
    }

    #[tokio::test]
    async fn enqueue_and_claim_in_submission_order() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let first = submit(&store, "addAuthUserToDB", now).await;
        let second = submit(&store, "addAuthUserToDB", now).await;
        submit(&store, "other", now).await;

        let claimed = store
            .claim(&queue(), &name("addAuthUserToDB"), now, lease(now))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, JobStatus::Active);

        let claimed = store
            .claim(&queue(), &name("addAuthUserToDB"), now, lease(now))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, second);

        // Jobs with other names are never handed out.
        assert!(store
            .claim(&queue(), &name("addAuthUserToDB"), now, lease(now))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn complete_deletes_the_record() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = submit(&store, "job", now).await;
        let claimed = store.claim(&queue(), &name("job"), now, lease(now)).await.unwrap().unwrap();

        assert!(!store.complete(&queue(), id, Uuid::new_v4()).await.unwrap());
        assert!(store.complete(&queue(), id, claimed.lease_token().unwrap()).await.unwrap());
        assert!(store.get(&queue(), id).await.unwrap().is_none());
        assert_eq!(store.counts(&queue()).await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn retried_jobs_rejoin_at_the_back_after_their_delay() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let first = submit(&store, "job", now).await;

        let mut claimed = store.claim(&queue(), &name("job"), now, lease(now)).await.unwrap().unwrap();
        let token = claimed.lease_token().unwrap();
        claimed.mark_failed("boom".into(), now, now);
        assert!(store.settle(&queue(), &claimed, token).await.unwrap());

        let second = submit(&store, "job", now).await;

        // Not yet due: only the fresh job is claimable.
        let next = store.claim(&queue(), &name("job"), now, lease(now)).await.unwrap().unwrap();
        assert_eq!(next.id, second);
        assert!(store.claim(&queue(), &name("job"), now, lease(now)).await.unwrap().is_none());

        let later = now + chrono::Duration::milliseconds(5000);
        let retried = store.claim(&queue(), &name("job"), later, lease(later)).await.unwrap().unwrap();
        assert_eq!(retried.id, first);
        assert_eq!(retried.attempts_made, 1);
    }

    #[tokio::test]
    async fn settle_requires_the_current_lease() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        submit(&store, "job", now).await;

        let mut claimed = store.claim(&queue(), &name("job"), now, lease(now)).await.unwrap().unwrap();
        claimed.mark_failed("boom".into(), now, now);
        assert!(!store.settle(&queue(), &claimed, Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn expired_leases_are_recovered_as_stalled() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = submit(&store, "job", now).await;
        let claimed = store.claim(&queue(), &name("job"), now, lease(now)).await.unwrap().unwrap();

        assert!(store.recover_stalled(&queue(), now).await.unwrap().is_empty());

        let later = now + chrono::Duration::seconds(31);
        let stalled = store.recover_stalled(&queue(), later).await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].status, JobStatus::Stalled);
        assert_eq!(stalled[0].attempts_made, 0);

        // The old holder can no longer complete it.
        let token = claimed.lease_token().unwrap();
        assert!(!store.complete(&queue(), id, token).await.unwrap());

        // It is claimable again.
        let again = store.claim(&queue(), &name("job"), later, lease(later)).await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.stalled_count, 1);
    }

    #[tokio::test]
    async fn renew_extends_the_lease() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = submit(&store, "job", now).await;
        let claimed = store.claim(&queue(), &name("job"), now, lease(now)).await.unwrap().unwrap();

        let extended = claimed.lease.unwrap().renewed(now + chrono::Duration::seconds(90));
        assert!(store.renew(&queue(), id, &extended).await.unwrap());
        assert!(store
            .recover_stalled(&queue(), now + chrono::Duration::seconds(60))
            .await
            .unwrap()
            .is_empty());

        assert!(!store.renew(&queue(), id, &Lease::new(now)).await.unwrap());
    }

    #[tokio::test]
    async fn stats_tracking() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        for _ in 0..5 {
            submit(&store, "job", now).await;
        }

        let counts = store.counts(&queue()).await.unwrap();
        assert_eq!(counts.waiting, 5);

        store.claim(&queue(), &name("job"), now, lease(now)).await.unwrap();
        store.claim(&queue(), &name("job"), now, lease(now)).await.unwrap();

        let counts = store.counts(&queue()).await.unwrap();
        assert_eq!(counts.waiting, 3);
        assert_eq!(counts.active, 2);

        let active = store.list(&queue(), Some(JobStatus::Active), 10).await.unwrap();
        assert_eq!(active.len(), 2);
        assert!(active[0].id < active[1].id);
    }
}
