//! Process-wide queue registry and the read-only board built from it.
//!
//! Every [`JobQueue`](crate::JobQueue) registers itself on construction. The
//! registry keeps one adapter per distinct queue (store identity plus queue
//! name) and rebuilds the whole [`Board`] from that set each time a queue is
//! constructed. Readers take an `Arc<Board>` snapshot.
//!
//! Handles that resolve to the same identity share one adapter, and with it
//! the set of job names that already have a processor.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::Serialize;

use chatty_core::{JobId, JobName, QueueName};

use crate::jobs::{Job, JobCounts, JobStatus, JobStore, StoreError};

/// Identity of a queue: the backing store it lives on plus its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey {
    pub store: String,
    pub queue: QueueName,
}

/// Read-only view of one queue, plus the job names bound to a processor.
#[derive(Clone)]
pub struct QueueAdapter {
    name: QueueName,
    store: Arc<dyn JobStore>,
    processors: Arc<Mutex<BTreeSet<JobName>>>,
}

impl fmt::Debug for QueueAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueAdapter")
            .field("name", &self.name)
            .field("store", &self.store.instance_id())
            .field("processors", &*self.lock_processors())
            .finish()
    }
}

impl QueueAdapter {
    pub fn new(name: QueueName, store: Arc<dyn JobStore>) -> Self {
        Self {
            name,
            store,
            processors: Arc::default(),
        }
    }

    fn lock_processors(&self) -> MutexGuard<'_, BTreeSet<JobName>> {
        self.processors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn key(&self) -> QueueKey {
        QueueKey {
            store: self.store.instance_id().to_string(),
            queue: self.name.clone(),
        }
    }

    /// Record that `job_name` now has a processor on this queue. Returns
    /// `false` if some handle already bound one.
    pub fn claim_processor(&self, job_name: &JobName) -> bool {
        self.lock_processors().insert(job_name.clone())
    }

    pub fn release_processor(&self, job_name: &JobName) {
        self.lock_processors().remove(job_name);
    }

    /// Job names with a processor, sorted.
    pub fn processors(&self) -> Vec<JobName> {
        self.lock_processors().iter().cloned().collect()
    }

    pub async fn summary(&self) -> Result<QueueSummary, StoreError> {
        let counts = self.store.counts(&self.name).await?;
        Ok(QueueSummary {
            name: self.name.clone(),
            processors: self.processors(),
            counts,
        })
    }
}

/// Per-queue job counts as shown on the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub name: QueueName,
    pub processors: Vec<JobName>,
    pub counts: JobCounts,
}

/// Board lookup error.
#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("job {job_id} not found in queue {queue}")]
    JobNotFound { queue: QueueName, job_id: JobId },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Consolidated read-only view over every registered queue.
#[derive(Debug, Default)]
pub struct Board {
    queues: Vec<QueueAdapter>,
}

impl Board {
    fn build(queues: Vec<QueueAdapter>) -> Self {
        Self { queues }
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Queue names in registration order.
    pub fn queue_names(&self) -> Vec<&QueueName> {
        self.queues.iter().map(QueueAdapter::name).collect()
    }

    fn adapter(&self, queue: &str) -> Result<&QueueAdapter, BoardError> {
        self.queues
            .iter()
            .find(|a| a.name.as_str() == queue)
            .ok_or_else(|| BoardError::QueueNotFound(queue.to_string()))
    }

    pub async fn overview(&self) -> Result<Vec<QueueSummary>, BoardError> {
        let mut summaries = Vec::with_capacity(self.queues.len());
        for adapter in &self.queues {
            summaries.push(adapter.summary().await?);
        }
        Ok(summaries)
    }

    pub async fn summary(&self, queue: &str) -> Result<QueueSummary, BoardError> {
        Ok(self.adapter(queue)?.summary().await?)
    }

    pub async fn jobs(
        &self,
        queue: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, BoardError> {
        let adapter = self.adapter(queue)?;
        Ok(adapter.store.list(&adapter.name, status, limit).await?)
    }

    pub async fn job(&self, queue: &str, id: JobId) -> Result<Job, BoardError> {
        let adapter = self.adapter(queue)?;
        adapter
            .store
            .get(&adapter.name, id)
            .await?
            .ok_or_else(|| BoardError::JobNotFound {
                queue: adapter.name.clone(),
                job_id: id,
            })
    }
}

/// Set of queues known to this process.
///
/// Created once at startup and passed to every queue constructor and to the
/// board router.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    adapters: Mutex<Vec<QueueAdapter>>,
    board: RwLock<Arc<Board>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a queue unless one with the same identity is already present, then
    /// rebuild the board from the full set. Returns the adapter held for that
    /// identity, which is the earlier one when the queue was already known.
    pub fn register(&self, adapter: QueueAdapter) -> QueueAdapter {
        let mut adapters = self
            .adapters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let key = adapter.key();
        let registered = match adapters.iter().find(|a| a.key() == key) {
            Some(existing) => existing.clone(),
            None => {
                tracing::debug!(queue = %key.queue, store = %key.store, "queue registered");
                adapters.push(adapter.clone());
                adapter
            }
        };

        let board = Arc::new(Board::build(adapters.clone()));
        *self.board.write().unwrap_or_else(PoisonError::into_inner) = board;
        registered
    }

    pub fn len(&self) -> usize {
        self.adapters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current board snapshot.
    pub fn board(&self) -> Arc<Board> {
        self.board
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
