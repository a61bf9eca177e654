//! Processor for `addAuthUserToDB` jobs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use chatty_queue::{Job, JobOutcome, Processor};

use crate::queues::AuthJob;
use crate::services::AuthUserRepository;

pub struct AuthWorker {
    repository: Arc<dyn AuthUserRepository>,
}

impl AuthWorker {
    pub fn new(repository: Arc<dyn AuthUserRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl Processor for AuthWorker {
    async fn process(&self, job: &Job) -> JobOutcome {
        let payload = match job.decode::<AuthJob>() {
            Ok(payload) => payload,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "invalid addAuthUserToDB payload");
                return JobOutcome::failed(format!("invalid payload: {e}"));
            }
        };
        let AuthJob::AddAuthUserToDb { value } = payload;

        match self.repository.create_auth_user(value).await {
            Ok(()) => JobOutcome::with_progress(100),
            Err(e) => {
                error!(job_id = %job.id, attempt = job.attempt(), error = %e, "failed to add auth user");
                JobOutcome::failed(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    use chatty_queue::{
        InMemoryJobStore, JobStore, QueueConfig, QueueEvent, QueueRegistry, RuntimeClock,
    };

    use super::*;
    use crate::queues::AuthQueue;
    use crate::services::auth::test_user;
    use crate::services::{AuthUser, InMemoryAuthUserRepository, RepositoryError};

    /// Fails the first `failures` writes, then delegates.
    struct FlakyRepository {
        failures: u32,
        calls: AtomicU32,
        inner: InMemoryAuthUserRepository,
    }

    #[async_trait]
    impl AuthUserRepository for FlakyRepository {
        async fn create_auth_user(&self, user: AuthUser) -> Result<(), RepositoryError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(RepositoryError::Unavailable("connection reset".into()));
            }
            self.inner.create_auth_user(user).await
        }

        async fn find_by_username(&self, username: &str) -> Result<Option<AuthUser>, RepositoryError> {
            self.inner.find_by_username(username).await
        }
    }

    fn auth_queue(repository: Arc<dyn AuthUserRepository>) -> AuthQueue {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let config = QueueConfig::default().with_clock(Arc::new(RuntimeClock::new()));
        AuthQueue::new(store, &QueueRegistry::new(), config, repository).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn alice_is_stored_after_one_failed_attempt() {
        let repository = Arc::new(FlakyRepository {
            failures: 1,
            calls: AtomicU32::new(0),
            inner: InMemoryAuthUserRepository::new(),
        });
        let queue = auth_queue(repository.clone());
        let mut events = queue.queue().subscribe();

        let submitted = Instant::now();
        let id = queue.add_auth_user_job(test_user("alice")).await.unwrap();

        loop {
            match events.recv().await.unwrap() {
                QueueEvent::Completed { job_id, attempt, progress, .. } if job_id == id => {
                    assert_eq!(attempt, 2);
                    assert_eq!(progress, Some(100));
                    break;
                }
                QueueEvent::Failed { .. } => panic!("job should not fail terminally"),
                _ => {}
            }
        }

        assert!(submitted.elapsed() >= Duration::from_millis(5000));
        assert_eq!(repository.calls.load(Ordering::SeqCst), 2);
        assert!(repository.find_by_username("alice").await.unwrap().is_some());
        assert!(queue.queue().get_job(id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_users_fail_after_three_attempts() {
        let repository = Arc::new(InMemoryAuthUserRepository::new());
        repository.create_auth_user(test_user("bob")).await.unwrap();
        let queue = auth_queue(repository);
        let mut events = queue.queue().subscribe();

        let id = queue.add_auth_user_job(test_user("bob")).await.unwrap();
        loop {
            if let QueueEvent::Failed { job_id, attempts_made, .. } = events.recv().await.unwrap() {
                assert_eq!(job_id, id);
                assert_eq!(attempts_made, 3);
                break;
            }
        }

        let job = queue.queue().get_job(id).await.unwrap().unwrap();
        assert_eq!(job.failed_reason.as_deref(), Some("auth user already exists: bob"));
    }
}
