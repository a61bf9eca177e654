//! Queue manager: submission, processor registration, dispatch and retries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use chatty_core::{DomainError, JobId, JobName, QueueName};

use super::payload::{self, PayloadError};
use super::store::{JobCounts, JobStore, StoreError};
use super::types::{Job, JobOutcome, Lease};
use crate::clock::{Clock, SystemClock};
use crate::registry::{QueueAdapter, QueueRegistry};

/// Work performed for one job name.
///
/// Any `Fn(Job) -> impl Future<Output = JobOutcome>` closure is a processor.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, job: &Job) -> JobOutcome;
}

#[async_trait]
impl<F, Fut> Processor for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    async fn process(&self, job: &Job) -> JobOutcome {
        (self)(job.clone()).await
    }
}

/// Shortest poll, lease or stall interval a queue will use.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Queue runtime configuration.
///
/// Intervals below [`MIN_INTERVAL`] are raised to it.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Fallback wake-up for idle dispatch loops
    pub poll_interval: Duration,
    /// How long a claimed job stays leased without renewal
    pub lease_duration: Duration,
    /// How often expired leases are swept
    pub stall_interval: Duration,
    /// Buffered events per subscriber
    pub event_capacity: usize,
    pub clock: Arc<dyn Clock>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            lease_duration: Duration::from_secs(30),
            stall_interval: Duration::from_secs(30),
            event_capacity: 1024,
            clock: Arc::new(SystemClock),
        }
    }
}

impl QueueConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease.max(MIN_INTERVAL);
        self
    }

    pub fn with_stall_interval(mut self, interval: Duration) -> Self {
        self.stall_interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn lease_from(&self, now: chrono::DateTime<chrono::Utc>) -> chrono::DateTime<chrono::Utc> {
        now + chrono::Duration::from_std(self.lease_duration.max(MIN_INTERVAL))
            .unwrap_or_else(|_| chrono::Duration::days(1))
    }

    fn renew_interval(&self) -> Duration {
        (self.lease_duration / 2).max(Duration::from_millis(10))
    }

    // The fields are public, so the builders are not the only way in.
    fn poll_period(&self) -> Duration {
        self.poll_interval.max(MIN_INTERVAL)
    }

    fn stall_period(&self) -> Duration {
        self.stall_interval.max(MIN_INTERVAL)
    }
}

/// Lifecycle notifications published by a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Active {
        queue: QueueName,
        job_id: JobId,
        job_name: JobName,
        attempt: u32,
    },
    Completed {
        queue: QueueName,
        job_id: JobId,
        job_name: JobName,
        attempt: u32,
        progress: Option<u8>,
    },
    Retrying {
        queue: QueueName,
        job_id: JobId,
        job_name: JobName,
        attempts_made: u32,
        reason: String,
        delay_ms: u64,
    },
    Failed {
        queue: QueueName,
        job_id: JobId,
        job_name: JobName,
        attempts_made: u32,
        reason: String,
    },
    Stalled {
        queue: QueueName,
        job_id: JobId,
        job_name: JobName,
        stalled_count: u32,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            QueueEvent::Active { job_id, .. }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::Retrying { job_id, .. }
            | QueueEvent::Failed { job_id, .. }
            | QueueEvent::Stalled { job_id, .. } => *job_id,
        }
    }
}

/// Queue manager error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    InvalidName(#[from] DomainError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("job store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue {queue} already has a processor for job {job_name}")]
    DuplicateProcessor { queue: QueueName, job_name: JobName },

    #[error("concurrency for job {0} must be at least 1")]
    InvalidConcurrency(JobName),

    #[error("queue {0} is closed")]
    Closed(QueueName),
}

struct WorkerSlot {
    name: JobName,
    processor: Arc<dyn Processor>,
    permits: Arc<Semaphore>,
    wakeup: Notify,
}

struct QueueInner {
    name: QueueName,
    store: Arc<dyn JobStore>,
    /// Shared with every other handle on the same store and queue name.
    adapter: QueueAdapter,
    config: QueueConfig,
    slots: Mutex<HashMap<JobName, Arc<WorkerSlot>>>,
    events: broadcast::Sender<QueueEvent>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    span: Span,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl QueueInner {
    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn wake(&self, name: &JobName) {
        if let Some(slot) = lock(&self.slots).get(name) {
            slot.wakeup.notify_one();
        }
    }

    /// Wake `slot` once `delay` has passed, unless the queue closes first.
    fn wake_after(&self, slot: Arc<WorkerSlot>, delay: Duration) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }

        let timer = tokio::spawn(
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => slot.wakeup.notify_one(),
                    _ = shutdown.changed() => {}
                }
            }
            .in_current_span(),
        );

        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(timer);
    }

    async fn check_stalled(&self) -> Result<Vec<JobId>, StoreError> {
        let stalled = self
            .store
            .recover_stalled(&self.name, self.config.clock.now())
            .await?;

        let mut ids = Vec::with_capacity(stalled.len());
        for job in stalled {
            warn!(
                job_id = %job.id,
                job_name = %job.name,
                stalled_count = job.stalled_count,
                "Job {} stalled",
                job.id
            );
            self.emit(QueueEvent::Stalled {
                queue: self.name.clone(),
                job_id: job.id,
                job_name: job.name.clone(),
                stalled_count: job.stalled_count,
            });
            self.wake(&job.name);
            ids.push(job.id);
        }
        Ok(ids)
    }
}

/// A named, durable job queue.
///
/// Cheap to clone; clones share processors, dispatch loops and events.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.inner.name)
            .field("store", &self.inner.store.instance_id())
            .finish()
    }
}

impl JobQueue {
    /// Create (or attach to) the queue `name` on `store` and publish it to the
    /// registry's board.
    pub fn new(
        name: impl AsRef<str>,
        store: Arc<dyn JobStore>,
        registry: &QueueRegistry,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        let name = QueueName::new(name.as_ref())?;
        let adapter = registry.register(QueueAdapter::new(name.clone(), store.clone()));

        let span = info_span!("queue", queue = %name);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        span.in_scope(|| {
            info!(store = store.instance_id(), "queue ready");
        });

        Ok(Self {
            inner: Arc::new(QueueInner {
                name,
                store,
                adapter,
                config,
                slots: Mutex::new(HashMap::new()),
                events,
                shutdown,
                tasks: Mutex::new(Vec::new()),
                span,
            }),
        })
    }

    pub fn name(&self) -> &QueueName {
        &self.inner.name
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    /// Submit a job. Returns once the store has accepted it; execution happens
    /// later on a worker slot.
    pub async fn submit<T>(&self, job_name: &str, payload: &T) -> Result<JobId, QueueError>
    where
        T: Serialize + ?Sized,
    {
        let name = JobName::new(job_name)?;
        let data = serde_json::to_value(payload).map_err(PayloadError::from)?;
        self.enqueue(name, data).await
    }

    /// Submit a tagged payload; the tag is the job name (see [`payload`]).
    pub async fn submit_typed<P: Serialize>(&self, payload: &P) -> Result<JobId, QueueError> {
        let (name, data) = payload::encode(payload)?;
        self.enqueue(name, data).await
    }

    async fn enqueue(&self, name: JobName, data: serde_json::Value) -> Result<JobId, QueueError> {
        let inner = &self.inner;
        let id = inner.store.next_id(&inner.name).await?;
        let job = Job::new(id, inner.name.clone(), name, data, inner.config.clock.now());
        inner.store.enqueue(&inner.name, &job).await?;

        inner.span.in_scope(|| {
            debug!(job_id = %id, job_name = %job.name, "job submitted");
        });
        inner.wake(&job.name);
        Ok(id)
    }

    /// Bind `processor` to `job_name` with at most `concurrency` executions in
    /// flight. Must be called inside a tokio runtime.
    ///
    /// A job name takes one processor per queue, across every handle attached
    /// to the same store and queue name.
    pub fn register_processor<P: Processor>(
        &self,
        job_name: &str,
        concurrency: usize,
        processor: P,
    ) -> Result<(), QueueError> {
        let name = JobName::new(job_name)?;
        if concurrency == 0 {
            return Err(QueueError::InvalidConcurrency(name));
        }

        let slot = Arc::new(WorkerSlot {
            name: name.clone(),
            processor: Arc::new(processor),
            permits: Arc::new(Semaphore::new(concurrency)),
            wakeup: Notify::new(),
        });

        let first = {
            let mut slots = lock(&self.inner.slots);
            // Checked under the slots lock so a concurrent close() sees the claim.
            if *self.inner.shutdown.borrow() {
                return Err(QueueError::Closed(self.inner.name.clone()));
            }
            if !self.inner.adapter.claim_processor(&name) {
                return Err(QueueError::DuplicateProcessor {
                    queue: self.inner.name.clone(),
                    job_name: name,
                });
            }
            let first = slots.is_empty();
            slots.insert(name.clone(), slot.clone());
            first
        };

        let span = self.inner.span.clone();
        let mut handles = vec![tokio::spawn(
            dispatch_loop(self.inner.clone(), slot).instrument(span.clone()),
        )];
        if first {
            handles.push(tokio::spawn(
                stall_sweeper(self.inner.clone()).instrument(span.clone()),
            ));
        }
        lock(&self.inner.tasks).extend(handles);

        span.in_scope(|| {
            info!(job_name = %name, concurrency, "processor registered");
        });
        Ok(())
    }

    /// Subscribe to lifecycle events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Re-queue jobs whose lease expired. Runs periodically once a processor
    /// is registered.
    pub async fn check_stalled(&self) -> Result<Vec<JobId>, QueueError> {
        Ok(self
            .inner
            .check_stalled()
            .instrument(self.inner.span.clone())
            .await?)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.inner.store.get(&self.inner.name, id).await?)
    }

    pub async fn counts(&self) -> Result<JobCounts, QueueError> {
        Ok(self.inner.store.counts(&self.inner.name).await?)
    }

    /// Stop dispatching and give up this handle's processors. Jobs already
    /// handed to a processor run to the end; pending retry timers are dropped.
    pub async fn close(&self) {
        self.inner.shutdown.send_replace(true);
        for (name, _) in lock(&self.inner.slots).drain() {
            self.inner.adapter.release_processor(&name);
        }
        let handles: Vec<_> = lock(&self.inner.tasks).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.inner.span.in_scope(|| info!("queue closed"));
    }
}

async fn dispatch_loop(inner: Arc<QueueInner>, slot: Arc<WorkerSlot>) {
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        if *shutdown.borrow() {
            break;
        }

        // A slot is taken before claiming, so claimed jobs never exceed the
        // concurrency limit.
        let permit = tokio::select! {
            permit = slot.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        let now = inner.config.clock.now();
        let lease = Lease::new(inner.config.lease_from(now));
        match inner.store.claim(&inner.name, &slot.name, now, lease).await {
            Ok(Some(job)) => {
                let inner = inner.clone();
                let slot = slot.clone();
                tokio::spawn(
                    async move {
                        run_job(&inner, slot, job).await;
                        drop(permit);
                    }
                    .in_current_span(),
                );
                continue;
            }
            Ok(None) => drop(permit),
            Err(e) => {
                drop(permit);
                error!(job_name = %slot.name, error = %e, "failed to claim job");
            }
        }

        tokio::select! {
            _ = slot.wakeup.notified() => {}
            _ = tokio::time::sleep(inner.config.poll_period()) => {}
            _ = shutdown.changed() => break,
        }
    }

    debug!(job_name = %slot.name, "dispatch loop stopped");
}

async fn run_job(inner: &QueueInner, slot: Arc<WorkerSlot>, mut job: Job) {
    let Some(mut lease) = job.lease else {
        warn!(job_id = %job.id, "claimed job has no lease; skipping");
        return;
    };
    let job_id = job.id;
    let attempt = job.attempt();
    let started = inner.config.clock.now();

    debug!(job_id = %job_id, job_name = %job.name, attempt, "job active");
    inner.emit(QueueEvent::Active {
        queue: inner.name.clone(),
        job_id,
        job_name: job.name.clone(),
        attempt,
    });

    let processor = slot.processor.clone();
    let input = job.clone();
    let mut handle = tokio::spawn(async move { processor.process(&input).await }.in_current_span());

    // Keep the lease alive while the processor runs.
    let joined = loop {
        tokio::select! {
            joined = &mut handle => break joined,
            _ = tokio::time::sleep(inner.config.renew_interval()) => {
                let renewed = lease.renewed(inner.config.lease_from(inner.config.clock.now()));
                match inner.store.renew(&inner.name, job_id, &renewed).await {
                    Ok(true) => lease = renewed,
                    Ok(false) => warn!(job_id = %job_id, "lease lost while job was running"),
                    Err(e) => warn!(job_id = %job_id, error = %e, "failed to renew lease"),
                }
            }
        }
    };

    let outcome = match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => JobOutcome::failed("processor panicked"),
        Err(e) => JobOutcome::failed(e),
    };
    let finished = inner.config.clock.now();

    match outcome {
        JobOutcome::Completed { progress } => {
            job.mark_completed(progress, started, finished);
            match inner.store.complete(&inner.name, job_id, lease.token).await {
                Ok(true) => {
                    info!(job_id = %job_id, job_name = %job.name, attempt, "Job {} completed", job_id);
                    inner.emit(QueueEvent::Completed {
                        queue: inner.name.clone(),
                        job_id,
                        job_name: job.name.clone(),
                        attempt,
                        progress: job.progress,
                    });
                }
                Ok(false) => {
                    warn!(job_id = %job_id, "job finished after its lease was lost; result dropped")
                }
                Err(e) => error!(job_id = %job_id, error = %e, "failed to remove completed job"),
            }
        }
        JobOutcome::Failed { reason } => {
            let retry_in = job.mark_failed(reason.clone(), started, finished);
            match inner.store.settle(&inner.name, &job, lease.token).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(job_id = %job_id, "job failed after its lease was lost; result dropped");
                    return;
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "failed to record job failure");
                    return;
                }
            }

            match retry_in {
                Some(delay) => {
                    warn!(
                        job_id = %job_id,
                        job_name = %job.name,
                        attempt,
                        error = %reason,
                        delay_ms = delay.as_millis() as u64,
                        "Job {} failed, retrying",
                        job_id
                    );
                    inner.emit(QueueEvent::Retrying {
                        queue: inner.name.clone(),
                        job_id,
                        job_name: job.name.clone(),
                        attempts_made: job.attempts_made,
                        reason,
                        delay_ms: delay.as_millis() as u64,
                    });
                    inner.wake_after(slot, delay);
                }
                None => {
                    error!(
                        job_id = %job_id,
                        job_name = %job.name,
                        attempts_made = job.attempts_made,
                        error = %reason,
                        "Job {} failed",
                        job_id
                    );
                    inner.emit(QueueEvent::Failed {
                        queue: inner.name.clone(),
                        job_id,
                        job_name: job.name.clone(),
                        attempts_made: job.attempts_made,
                        reason,
                    });
                }
            }
        }
    }
}

async fn stall_sweeper(inner: Arc<QueueInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut ticker = tokio::time::interval(inner.config.stall_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if let Err(e) = inner.check_stalled().await {
            error!(error = %e, "stall check failed");
        }
    }
}
