//! Redis-backed job store (shared across processes).
//!
//! Key layout for a queue `q`:
//!
//! - `bull:q:id`: job id counter (`INCR`)
//! - `bull:q:job:<id>`: job record as JSON
//! - `bull:q:jobs`: sorted set of every stored id (score = id)
//! - `bull:q:wait:<name>`: waiting list per job name
//! - `bull:q:delayed:<name>`: backoff set per job name (score = ready_at ms)
//! - `bull:q:active`: leased ids (score = lease expiry ms)
//! - `bull:q:locks`: hash of id to lease token
//! - `bull:q:failed`: terminally failed ids (score = failure time ms)
//!
//! Claim, complete, settle and stall recovery run as Lua scripts so each
//! transition is atomic on the server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, instrument};
use uuid::Uuid;

use chatty_core::{JobId, JobName, QueueName};

use super::store::{JobCounts, JobStore, StoreError};
use super::types::{Job, JobStatus, Lease};

const KEY_PREFIX: &str = "bull";

const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('RPUSH', KEYS[1], id)
end
while true do
  local id = redis.call('LPOP', KEYS[1])
  if not id then
    return false
  end
  local raw = redis.call('GET', ARGV[4] .. id)
  if raw then
    redis.call('ZADD', KEYS[3], ARGV[2], id)
    redis.call('HSET', KEYS[4], id, ARGV[3])
    return {id, raw}
  end
end
"#;

const WRITE_LEASED_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('SET', KEYS[2], ARGV[3])
redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
return 1
"#;

const COMPLETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('DEL', KEYS[2])
return 1
"#;

const SETTLE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('SET', KEYS[2], ARGV[3])
if ARGV[4] ~= '' then
  redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
else
  redis.call('ZADD', KEYS[5], ARGV[5], ARGV[1])
end
return 1
"#;

const RECOVER_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('HDEL', KEYS[2], id)
end
return expired
"#;

struct Keys {
    base: String,
}

impl Keys {
    fn new(queue: &QueueName) -> Self {
        Self {
            base: format!("{KEY_PREFIX}:{queue}"),
        }
    }

    fn id(&self) -> String {
        format!("{}:id", self.base)
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.base)
    }

    fn job(&self, id: JobId) -> String {
        format!("{}:job:{id}", self.base)
    }

    fn jobs(&self) -> String {
        format!("{}:jobs", self.base)
    }

    fn wait(&self, name: &JobName) -> String {
        format!("{}:wait:{name}", self.base)
    }

    fn delayed(&self, name: &JobName) -> String {
        format!("{}:delayed:{name}", self.base)
    }

    fn active(&self) -> String {
        format!("{}:active", self.base)
    }

    fn locks(&self) -> String {
        format!("{}:locks", self.base)
    }

    fn failed(&self) -> String {
        format!("{}:failed", self.base)
    }
}

fn command_error(e: redis::RedisError) -> StoreError {
    if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Command(e.to_string())
    }
}

fn to_json(job: &Job) -> Result<String, StoreError> {
    serde_json::to_string(job).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json(raw: &str) -> Result<Job, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Job store on a Redis server.
#[derive(Clone)]
pub struct RedisJobStore {
    url: String,
    conn: MultiplexedConnection,
    claim: Script,
    write_leased: Script,
    complete: Script,
    settle: Script,
    recover: Script,
}

impl std::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobStore").field("url", &self.url).finish()
    }
}

impl RedisJobStore {
    /// Connect to Redis (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let url = redis_url.as_ref().to_string();
        let client =
            redis::Client::open(url.as_str()).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        debug!(url = %url, "connected to redis job store");
        Ok(Self {
            url,
            conn,
            claim: Script::new(CLAIM_SCRIPT),
            write_leased: Script::new(WRITE_LEASED_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
            settle: Script::new(SETTLE_SCRIPT),
            recover: Script::new(RECOVER_SCRIPT),
        })
    }

    async fn load_all(&self, queue: &QueueName) -> Result<Vec<Job>, StoreError> {
        let keys = Keys::new(queue);
        let mut conn = self.conn.clone();

        let ids: Vec<u64> = conn.zrange(keys.jobs(), 0, -1).await.map_err(command_error)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let job_keys: Vec<String> = ids.into_iter().map(|id| keys.job(JobId::new(id))).collect();
        let raws: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&job_keys)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        raws.into_iter().flatten().map(|raw| from_json(&raw)).collect()
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    fn instance_id(&self) -> &str {
        &self.url
    }

    async fn next_id(&self, queue: &QueueName) -> Result<JobId, StoreError> {
        let mut conn = self.conn.clone();
        let id: u64 = conn.incr(Keys::new(queue).id(), 1).await.map_err(command_error)?;
        Ok(JobId::new(id))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn enqueue(&self, queue: &QueueName, job: &Job) -> Result<(), StoreError> {
        let keys = Keys::new(queue);
        let mut conn = self.conn.clone();
        let raw = to_json(job)?;

        let created: Option<String> = redis::cmd("SET")
            .arg(keys.job(job.id))
            .arg(raw)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        if created.is_none() {
            return Err(StoreError::AlreadyExists(job.id));
        }

        redis::pipe()
            .atomic()
            .zadd(keys.jobs(), job.id.get(), job.id.get())
            .ignore()
            .rpush(keys.wait(&job.name), job.id.get())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn claim(
        &self,
        queue: &QueueName,
        name: &JobName,
        now: DateTime<Utc>,
        lease: Lease,
    ) -> Result<Option<Job>, StoreError> {
        let keys = Keys::new(queue);
        let mut conn = self.conn.clone();
        let token = lease.token.to_string();

        let claimed: Option<(u64, String)> = self
            .claim
            .key(keys.wait(name))
            .key(keys.delayed(name))
            .key(keys.active())
            .key(keys.locks())
            .arg(now.timestamp_millis())
            .arg(lease.expires_at.timestamp_millis())
            .arg(&token)
            .arg(keys.job_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;

        let Some((id, raw)) = claimed else {
            return Ok(None);
        };

        let mut job = from_json(&raw)?;
        job.mark_active(lease, now);

        let written: i64 = self
            .write_leased
            .key(keys.locks())
            .key(keys.job(JobId::new(id)))
            .key(keys.active())
            .arg(id)
            .arg(&token)
            .arg(to_json(&job)?)
            .arg(lease.expires_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;

        Ok((written == 1).then_some(job))
    }

    async fn renew(&self, queue: &QueueName, id: JobId, lease: &Lease) -> Result<bool, StoreError> {
        let Some(mut job) = self.get(queue, id).await? else {
            return Ok(false);
        };
        if job.status != JobStatus::Active || job.lease_token() != Some(lease.token) {
            return Ok(false);
        }
        job.lease = Some(*lease);

        let keys = Keys::new(queue);
        let mut conn = self.conn.clone();
        let written: i64 = self
            .write_leased
            .key(keys.locks())
            .key(keys.job(id))
            .key(keys.active())
            .arg(id.get())
            .arg(lease.token.to_string())
            .arg(to_json(&job)?)
            .arg(lease.expires_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(written == 1)
    }

    async fn complete(&self, queue: &QueueName, id: JobId, token: Uuid) -> Result<bool, StoreError> {
        let keys = Keys::new(queue);
        let mut conn = self.conn.clone();
        let done: i64 = self
            .complete
            .key(keys.locks())
            .key(keys.job(id))
            .key(keys.active())
            .key(keys.jobs())
            .arg(id.get())
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(done == 1)
    }

    async fn settle(&self, queue: &QueueName, job: &Job, token: Uuid) -> Result<bool, StoreError> {
        let keys = Keys::new(queue);
        let mut conn = self.conn.clone();

        // Retries go through the delayed set; a job without a backoff
        // deadline is promoted on the next claim.
        let ready_ms = if job.status.is_claimable() {
            job.ready_at.unwrap_or(job.updated_at).timestamp_millis().to_string()
        } else {
            String::new()
        };

        let done: i64 = self
            .settle
            .key(keys.locks())
            .key(keys.job(job.id))
            .key(keys.active())
            .key(keys.delayed(&job.name))
            .key(keys.failed())
            .arg(job.id.get())
            .arg(token.to_string())
            .arg(to_json(job)?)
            .arg(ready_ms)
            .arg(job.updated_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(done == 1)
    }

    async fn recover_stalled(
        &self,
        queue: &QueueName,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let keys = Keys::new(queue);
        let mut conn = self.conn.clone();

        let expired: Vec<u64> = self
            .recover
            .key(keys.active())
            .key(keys.locks())
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;

        let mut stalled = Vec::with_capacity(expired.len());
        for id in expired {
            let id = JobId::new(id);
            let Some(mut job) = self.get(queue, id).await? else {
                continue;
            };
            job.mark_stalled(now);

            redis::pipe()
                .atomic()
                .set(keys.job(id), to_json(&job)?)
                .ignore()
                .rpush(keys.wait(&job.name), id.get())
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(command_error)?;
            stalled.push(job);
        }
        Ok(stalled)
    }

    async fn get(&self, queue: &QueueName, id: JobId) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(Keys::new(queue).job(id))
            .await
            .map_err(command_error)?;
        raw.as_deref().map(from_json).transpose()
    }

    async fn list(
        &self,
        queue: &QueueName,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .load_all(queue)
            .await?
            .into_iter()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .take(limit)
            .collect())
    }

    async fn counts(&self, queue: &QueueName) -> Result<JobCounts, StoreError> {
        let mut counts = JobCounts::default();
        for job in self.load_all(queue).await? {
            counts.record(job.status);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Live-server tests are #[ignore]d; run them with `--features redis -- --ignored`.
    async fn store() -> RedisJobStore {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        RedisJobStore::connect(url)
            .await
            .expect("failed to connect to redis")
    }

    fn fresh_queue() -> QueueName {
        QueueName::new(format!("test-{}", Uuid::new_v4().simple())).unwrap()
    }

    #[test]
    fn keys_follow_the_bull_layout() {
        let keys = Keys::new(&QueueName::new("authQueue").unwrap());
        let name = JobName::new("addAuthUserToDB").unwrap();
        assert_eq!(keys.id(), "bull:authQueue:id");
        assert_eq!(keys.job(JobId::new(7)), "bull:authQueue:job:7");
        assert_eq!(keys.wait(&name), "bull:authQueue:wait:addAuthUserToDB");
        assert_eq!(keys.delayed(&name), "bull:authQueue:delayed:addAuthUserToDB");
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    async fn claim_complete_and_retry_against_redis() {
        let store = store().await;
        let queue = fresh_queue();
        let name = JobName::new("addAuthUserToDB").unwrap();
        let now = Utc::now();

        let id = store.next_id(&queue).await.unwrap();
        let job = Job::new(id, queue.clone(), name.clone(), serde_json::json!({}), now);
        store.enqueue(&queue, &job).await.unwrap();

        let lease = Lease::new(now + chrono::Duration::seconds(30));
        let mut claimed = store.claim(&queue, &name, now, lease).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Active);

        let delay = claimed.mark_failed("boom".into(), now, now).unwrap();
        assert!(store.settle(&queue, &claimed, lease.token).await.unwrap());
        assert!(store.claim(&queue, &name, now, Lease::new(now)).await.unwrap().is_none());

        let later = now + chrono::Duration::from_std(delay).unwrap();
        let lease = Lease::new(later + chrono::Duration::seconds(30));
        let retried = store.claim(&queue, &name, later, lease).await.unwrap().unwrap();
        assert_eq!(retried.attempts_made, 1);

        assert!(store.complete(&queue, id, lease.token).await.unwrap());
        assert!(store.get(&queue, id).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    async fn settled_and_stalled_jobs_leave_no_lock_behind() {
        let store = store().await;
        let queue = fresh_queue();
        let keys = Keys::new(&queue);
        let name = JobName::new("addAuthUserToDB").unwrap();
        let mut conn = store.conn.clone();
        let now = Utc::now();

        let stalled_id = store.next_id(&queue).await.unwrap();
        let job = Job::new(stalled_id, queue.clone(), name.clone(), serde_json::json!({}), now);
        store.enqueue(&queue, &job).await.unwrap();
        let lease = Lease::new(now + chrono::Duration::seconds(1));
        store.claim(&queue, &name, now, lease).await.unwrap().unwrap();

        let locked: Option<String> = conn.hget(keys.locks(), stalled_id.get()).await.unwrap();
        assert_eq!(locked, Some(lease.token.to_string()));

        let later = now + chrono::Duration::seconds(2);
        let stalled = store.recover_stalled(&queue, later).await.unwrap();
        assert_eq!(stalled.iter().map(|j| j.id).collect::<Vec<_>>(), vec![stalled_id]);

        let locked: Option<String> = conn.hget(keys.locks(), stalled_id.get()).await.unwrap();
        assert!(locked.is_none());
        let active: Vec<u64> = conn.zrange(keys.active(), 0, -1).await.unwrap();
        assert!(active.is_empty());
        let waiting: Vec<u64> = conn.lrange(keys.wait(&name), 0, -1).await.unwrap();
        assert_eq!(waiting, vec![stalled_id.get()]);

        // Exhaust the attempts: the last settle lands in the failed set.
        let mut at = later;
        loop {
            let lease = Lease::new(at + chrono::Duration::seconds(30));
            let mut job = store.claim(&queue, &name, at, lease).await.unwrap().unwrap();
            let retry_in = job.mark_failed("boom".into(), at, at);
            assert!(store.settle(&queue, &job, lease.token).await.unwrap());
            match retry_in {
                Some(delay) => at += chrono::Duration::from_std(delay).unwrap(),
                None => break,
            }
        }

        let failed: Vec<u64> = conn.zrange(keys.failed(), 0, -1).await.unwrap();
        assert_eq!(failed, vec![stalled_id.get()]);
        let locks: usize = conn.hlen(keys.locks()).await.unwrap();
        assert_eq!(locks, 0);
        let delayed: usize = conn.zcard(keys.delayed(&name)).await.unwrap();
        assert_eq!(delayed, 0);
    }
}
