pub mod postgres_store;
pub mod retry;
pub mod truncate;

pub use postgres_store::{create_pool, PostgresStateStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core::{Crawl, Job, JobStatus};
use serde_json::Value;

/// Durable per-job and per-crawl records; transactional counters; URL
/// locks; team-job sets (§4.1). Implemented here over Postgres JSONB
/// columns; every method is expected to retry transient failures
/// internally (see `retry`) and surface `AppError::StoreUnavailable`
/// only once retries are exhausted.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn create_job(&self, job: &Job) -> core::Result<()>;
    async fn mark_job_started(&self, job_id: &str) -> core::Result<()>;
    async fn mark_job_completed(&self, job_id: &str, result: Value) -> core::Result<()>;
    async fn mark_job_failed(&self, job_id: &str, error: &str) -> core::Result<()>;
    async fn update_job_progress(&self, job_id: &str, progress: Value) -> core::Result<()>;

    async fn get_job_state(&self, job_id: &str) -> core::Result<Option<JobStatus>>;
    async fn get_job_result(&self, job_id: &str) -> core::Result<Option<Value>>;
    async fn get_job_error(&self, job_id: &str) -> core::Result<Option<String>>;
    async fn get_job_data(&self, job_id: &str) -> core::Result<Option<Job>>;
    async fn remove_job(&self, job_id: &str) -> core::Result<()>;

    async fn save_crawl(&self, crawl: &Crawl) -> core::Result<()>;
    async fn get_crawl(&self, crawl_id: &str) -> core::Result<Option<Crawl>>;
    async fn get_crawl_expiry(&self, crawl_id: &str) -> core::Result<Option<DateTime<Utc>>>;

    async fn add_crawl_job(&self, crawl_id: &str, job_id: &str) -> core::Result<()>;
    async fn add_crawl_jobs(&self, crawl_id: &str, job_ids: &[String]) -> core::Result<()>;
    /// Records a terminal outcome for `job_id` within `crawl_id`'s
    /// counters in the same transaction, flips the crawl to `completed`
    /// once finished (§3 Crawl invariant).
    async fn add_crawl_job_done(&self, crawl_id: &str, job_id: &str, success: bool) -> core::Result<()>;

    async fn get_done_jobs_ordered_length(&self, crawl_id: &str) -> core::Result<u64>;
    /// `end = None` means "to the last" (§4.1).
    async fn get_done_jobs_ordered(&self, crawl_id: &str, start: i64, end: Option<i64>) -> core::Result<Vec<String>>;

    async fn is_crawl_finished(&self, crawl_id: &str) -> core::Result<bool>;
    async fn finish_crawl(&self, crawl_id: &str) -> core::Result<()>;

    /// Returns `true` iff the caller created the lock.
    async fn lock_url(&self, url: &str, crawl_id: &str) -> core::Result<bool>;
    /// Returns `true` only if every URL in `urls` was newly locked.
    async fn lock_urls(&self, crawl_id: &str, urls: &[String]) -> core::Result<bool>;

    async fn add_team_job(&self, team_id: &str, job_id: &str) -> core::Result<()>;
    async fn remove_team_job(&self, team_id: &str, job_id: &str) -> core::Result<()>;
    async fn get_team_job_count(&self, team_id: &str) -> core::Result<u64>;
}
