//! `authQueue`: persists new auth users off the request path.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use chatty_core::JobId;
use chatty_queue::{JobQueue, JobStore, QueueConfig, QueueError, QueueRegistry};

use crate::services::{AuthUser, AuthUserRepository};
use crate::workers::AuthWorker;

pub const AUTH_QUEUE: &str = "authQueue";

/// Jobs handled by [`AuthQueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum AuthJob {
    #[serde(rename = "addAuthUserToDB")]
    AddAuthUserToDb { value: AuthUser },
}

impl AuthJob {
    pub const ADD_AUTH_USER_TO_DB: &'static str = "addAuthUserToDB";
}

#[derive(Debug, Clone)]
pub struct AuthQueue {
    queue: JobQueue,
}

impl AuthQueue {
    /// Concurrent `addAuthUserToDB` executions per process.
    pub const CONCURRENCY: usize = 5;

    /// Create the queue and start its worker.
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: &QueueRegistry,
        config: QueueConfig,
        repository: Arc<dyn AuthUserRepository>,
    ) -> Result<Self, QueueError> {
        let queue = JobQueue::new(AUTH_QUEUE, store, registry, config)?;
        queue.register_processor(
            AuthJob::ADD_AUTH_USER_TO_DB,
            Self::CONCURRENCY,
            AuthWorker::new(repository),
        )?;
        Ok(Self { queue })
    }

    pub async fn add_auth_user_job(&self, user: AuthUser) -> Result<JobId, QueueError> {
        self.queue
            .submit_typed(&AuthJob::AddAuthUserToDb { value: user })
            .await
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub async fn close(&self) {
        self.queue.close().await;
    }
}
