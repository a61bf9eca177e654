//! Time source for job timestamps, backoff deadlines and leases.

use std::fmt::Debug;

use chrono::{DateTime, Utc};

/// Wall-clock source used by queues.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock driven by the tokio timer.
///
/// Anchored to the system time at construction and advanced by
/// `tokio::time::Instant`, so it follows `tokio::time::pause`/`advance` in tests.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeClock {
    origin_wall: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl RuntimeClock {
    pub fn new() -> Self {
        Self {
            origin_wall: Utc::now(),
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for RuntimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RuntimeClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().saturating_duration_since(self.origin);
        self.origin_wall + chrono::Duration::from_std(elapsed).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn runtime_clock_follows_paused_time() {
        let clock = RuntimeClock::new();
        let start = clock.now();

        tokio::time::advance(Duration::from_millis(5000)).await;

        assert_eq!(clock.now() - start, chrono::Duration::milliseconds(5000));
    }
}
