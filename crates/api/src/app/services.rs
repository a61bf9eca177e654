//! Service wiring: backing store, queue registry and application queues.

use std::sync::Arc;

#[cfg(not(feature = "redis"))]
use chatty_queue::InMemoryJobStore;
use chatty_queue::{JobStore, QueueConfig, QueueError, QueueRegistry, StoreError};

use crate::config::Config;
use crate::queues::AuthQueue;
use crate::services::{AuthUserRepository, InMemoryAuthUserRepository};

#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error("failed to open job store: {0}")]
    Store(#[from] StoreError),

    #[error("failed to start queues: {0}")]
    Queue(#[from] QueueError),
}

pub struct AppServices {
    pub registry: Arc<QueueRegistry>,
    pub auth_queue: AuthQueue,
    pub auth_users: Arc<dyn AuthUserRepository>,
}

impl AppServices {
    /// Stop every queue's dispatch loops.
    pub async fn shutdown(&self) {
        self.auth_queue.close().await;
    }
}

pub async fn build_services(config: &Config) -> Result<AppServices, ServicesError> {
    let store = open_store(config).await?;
    let auth_users: Arc<dyn AuthUserRepository> = Arc::new(InMemoryAuthUserRepository::new());
    Ok(build_services_with(store, config.queue_config(), auth_users)?)
}

/// Wire queues onto an existing store (used directly by tests).
pub fn build_services_with(
    store: Arc<dyn JobStore>,
    queue_config: QueueConfig,
    auth_users: Arc<dyn AuthUserRepository>,
) -> Result<AppServices, QueueError> {
    let registry = Arc::new(QueueRegistry::new());
    let auth_queue = AuthQueue::new(store, &registry, queue_config, auth_users.clone())?;

    Ok(AppServices {
        registry,
        auth_queue,
        auth_users,
    })
}

#[cfg(feature = "redis")]
async fn open_store(config: &Config) -> Result<Arc<dyn JobStore>, StoreError> {
    let store = chatty_queue::jobs::RedisJobStore::connect(&config.redis_host).await?;
    tracing::info!(redis = %config.redis_host, "using redis job store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn open_store(config: &Config) -> Result<Arc<dyn JobStore>, StoreError> {
    tracing::warn!(
        redis = %config.redis_host,
        "built without the redis feature; jobs are kept in memory"
    );
    Ok(Arc::new(InMemoryJobStore::new()))
}
