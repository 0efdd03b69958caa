use crate::{LeaseQueue, QueueJob, QueueProvider};
use async_trait::async_trait;
use bb8_redis::{bb8, redis::AsyncCommands, RedisConnectionManager};
use core::{AppError, Job, JobOptions, JobPayload, JobStatus};
use serde_json::json;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use store::StateStore;
use tracing::{info, warn};

pub type RedisPool = bb8::Pool<RedisConnectionManager>;

/// Ordered priority queue over a Redis sorted set (§4.2 Variant A).
/// Jobs are first-class broker objects with attempts, exponential
/// backoff starting at 1s, and a TTL after which stale entries are
/// dropped even if never claimed.
pub struct BrokerQueueProvider {
    pool: RedisPool,
    state_store: Arc<dyn StateStore>,
    queue_name: String,
    lock_duration_ms: u64,
    job_ttl_secs: u64,
    max_stalled_count: u32,
}

impl BrokerQueueProvider {
    pub async fn connect(
        broker_url: &str,
        state_store: Arc<dyn StateStore>,
        queue_name: String,
        lock_duration_ms: u64,
        job_ttl_secs: u64,
        max_stalled_count: u32,
    ) -> core::Result<Self> {
        let manager = RedisConnectionManager::new(broker_url)
            .map_err(|e| AppError::QueueUnavailable(format!("invalid broker url: {e}")))?;
        let pool = bb8::Pool::builder()
            .max_size(20)
            .build(manager)
            .await
            .map_err(|e| AppError::QueueUnavailable(format!("failed to build broker pool: {e}")))?;

        info!(queue_name, "broker queue provider connected");
        Ok(Self {
            pool,
            state_store,
            queue_name,
            lock_duration_ms,
            job_ttl_secs,
            max_stalled_count,
        })
    }

    fn waiting_key(&self) -> String {
        format!("queue:{}:waiting", self.queue_name)
    }

    fn active_key(&self) -> String {
        format!("queue:{}:active", self.queue_name)
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("queue:{}:job:{}", self.queue_name, job_id)
    }

    async fn conn(&self) -> core::Result<bb8::PooledConnection<'_, RedisConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| AppError::QueueUnavailable(format!("broker pool exhausted: {e}")))
    }

    /// Score combines priority (dominant, ascending = higher priority
    /// first) with enqueue time (secondary, FIFO among equal priority).
    fn score(priority: i32, enqueued_at_ms: i64) -> f64 {
        (priority as f64) * 1e13 + (enqueued_at_ms as f64)
    }

    fn now_ms() -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_orders_by_priority_before_enqueue_time() {
        // Lower numeric priority must sort first regardless of age.
        let older_low_priority = BrokerQueueProvider::score(1, 1_000);
        let newer_high_priority = BrokerQueueProvider::score(5, 0);
        assert!(older_low_priority < newer_high_priority);
    }

    #[test]
    fn score_breaks_ties_by_enqueue_time() {
        let earlier = BrokerQueueProvider::score(5, 1_000);
        let later = BrokerQueueProvider::score(5, 2_000);
        assert!(earlier < later);
    }
}

#[async_trait]
impl QueueProvider for BrokerQueueProvider {
    async fn add_job(&self, name: &str, data: JobPayload, options: JobOptions) -> core::Result<String> {
        let job_id = options.job_id.clone();
        let job = Job::new(job_id.clone(), name.to_string(), data, options.clone());
        self.state_store.create_job(&job).await?;

        let mut conn = self.conn().await?;
        let job_doc = serde_json::to_string(&job).map_err(AppError::Json)?;
        let now = Self::now_ms();

        let _: () = conn
            .hset(self.job_key(&job_id), "doc", &job_doc)
            .await
            .map_err(AppError::Redis)?;
        let _: () = conn
            .expire(self.job_key(&job_id), self.job_ttl_secs as i64)
            .await
            .map_err(AppError::Redis)?;
        let _: () = conn
            .zadd(self.waiting_key(), &job_id, Self::score(options.priority, now))
            .await
            .map_err(AppError::Redis)?;

        Ok(job_id)
    }

    async fn get_job(&self, job_id: &str) -> core::Result<Option<QueueJob>> {
        let Some(job) = self.state_store.get_job_data(job_id).await? else {
            return Ok(None);
        };
        Ok(Some(QueueJob {
            id: job.id,
            name: job.name,
            data: job.data,
            options: job.options,
            progress: job.progress,
        }))
    }

    async fn remove_job(&self, job_id: &str) -> core::Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.zrem(self.waiting_key(), job_id).await.map_err(AppError::Redis)?;
        let _: () = conn.hdel(self.active_key(), job_id).await.map_err(AppError::Redis)?;
        let _: () = conn.del(self.job_key(job_id)).await.map_err(AppError::Redis)?;
        self.state_store.remove_job(job_id).await?;
        Ok(())
    }

    async fn get_active_count(&self) -> core::Result<u64> {
        let mut conn = self.conn().await?;
        let n: u64 = conn.hlen(self.active_key()).await.map_err(AppError::Redis)?;
        Ok(n)
    }

    async fn get_waiting_count(&self) -> core::Result<u64> {
        let mut conn = self.conn().await?;
        let n: u64 = conn.zcard(self.waiting_key()).await.map_err(AppError::Redis)?;
        Ok(n)
    }

    async fn on_job_complete(&self, job_id: &str) -> core::Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.hdel(self.active_key(), job_id).await.map_err(AppError::Redis)?;
        let _: () = conn.del(self.job_key(job_id)).await.map_err(AppError::Redis)?;
        Ok(())
    }

    async fn on_job_failed(&self, job_id: &str) -> core::Result<()> {
        // Permanent failure (attempts exhausted) — same broker-side
        // cleanup as completion; the terminal status itself lives in
        // the State Store.
        self.on_job_complete(job_id).await
    }

    fn state_store(&self) -> &Arc<dyn StateStore> {
        &self.state_store
    }
}

#[async_trait]
impl LeaseQueue for BrokerQueueProvider {
    async fn get_next_job(&self, token: &str) -> core::Result<Option<QueueJob>> {
        let mut conn = self.conn().await?;

        // ZPOPMIN-by-hand: the lowest-score member is the next job to
        // run. ZREM is the commit — if it returns 0 a concurrent worker
        // already claimed this id, so retry against the new head.
        for _ in 0..5 {
            let candidates: Vec<String> = conn
                .zrangebyscore_limit(self.waiting_key(), "-inf", "+inf", 0, 1)
                .await
                .map_err(AppError::Redis)?;
            let Some(job_id) = candidates.into_iter().next() else {
                return Ok(None);
            };

            let removed: i64 = conn.zrem(self.waiting_key(), &job_id).await.map_err(AppError::Redis)?;
            if removed == 0 {
                continue;
            }

            let lease_expires_at = Self::now_ms() + self.lock_duration_ms as i64;
            let _: () = conn
                .hset(self.active_key(), &job_id, json!({ "token": token, "leaseExpiresAt": lease_expires_at }).to_string())
                .await
                .map_err(AppError::Redis)?;

            match self.state_store.get_job_data(&job_id).await? {
                Some(job) => {
                    return Ok(Some(QueueJob {
                        id: job.id,
                        name: job.name,
                        data: job.data,
                        options: job.options,
                        progress: job.progress,
                    }))
                }
                None => {
                    // The State Store record is gone (trimmed or never
                    // committed) — drop the lease and keep polling.
                    let _: () = conn.hdel(self.active_key(), &job_id).await.map_err(AppError::Redis)?;
                    continue;
                }
            }
        }

        warn!(token, "get_next_job gave up after repeated concurrent-claim retries");
        Ok(None)
    }

    async fn extend_lock(&self, token: &str, job_id: &str, extension_ms: u64) -> core::Result<()> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.hget(self.active_key(), job_id).await.map_err(AppError::Redis)?;
        let Some(raw) = raw else {
            return Err(AppError::NotFound(format!("no active lease for job {job_id}")));
        };
        let lease: serde_json::Value = serde_json::from_str(&raw).map_err(AppError::Json)?;
        if lease.get("token").and_then(|t| t.as_str()) != Some(token) {
            return Err(AppError::Conflict(format!("lease for job {job_id} is held by another worker")));
        }

        let lease_expires_at = Self::now_ms() + extension_ms as i64;
        let _: () = conn
            .hset(self.active_key(), job_id, json!({ "token": token, "leaseExpiresAt": lease_expires_at }).to_string())
            .await
            .map_err(AppError::Redis)?;
        Ok(())
    }

    async fn reclaim_stalled(&self) -> core::Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let active: Vec<(String, String)> = conn.hgetall(self.active_key()).await.map_err(AppError::Redis)?;
        let now = Self::now_ms();
        let mut reclaimed = Vec::new();

        for (job_id, raw) in active {
            let Ok(lease) = serde_json::from_str::<serde_json::Value>(&raw) else {
                continue;
            };
            let lease_expires_at = lease.get("leaseExpiresAt").and_then(|v| v.as_i64()).unwrap_or(0);
            if lease_expires_at > now {
                continue;
            }

            let stalled_key = format!("{}:stalled_count", self.job_key(&job_id));
            let stalled_count: i64 = conn.incr(&stalled_key, 1).await.map_err(AppError::Redis)?;
            let _: () = conn.expire(&stalled_key, self.job_ttl_secs as i64).await.map_err(AppError::Redis)?;
            let _: () = conn.hdel(self.active_key(), &job_id).await.map_err(AppError::Redis)?;

            if (stalled_count as u32) <= self.max_stalled_count {
                if let Some(job) = self.state_store.get_job_data(&job_id).await? {
                    if job.status == JobStatus::Active {
                        let _: () = conn
                            .zadd(self.waiting_key(), &job_id, Self::score(job.options.priority, now))
                            .await
                            .map_err(AppError::Redis)?;
                        warn!(job_id, stalled_count, "reclaimed stalled job, re-queued");
                        reclaimed.push(job_id);
                    }
                }
            } else {
                warn!(job_id, stalled_count, "job exceeded max stalled count, dead-lettering");
                self.state_store
                    .mark_job_failed(&job_id, "exceeded max stalled count")
                    .await?;
                let _: () = conn.del(self.job_key(&job_id)).await.map_err(AppError::Redis)?;
            }
        }

        Ok(reclaimed)
    }
}
