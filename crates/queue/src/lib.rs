pub mod broker;
pub mod dispatcher;

pub use broker::BrokerQueueProvider;
pub use dispatcher::DispatcherQueueProvider;

use async_trait::async_trait;
use core::{JobOptions, JobPayload, JobStatus};
use serde_json::Value;
use std::sync::Arc;
use store::StateStore;

/// A point-in-time snapshot of a queued job, handed back by `get_job`
/// (§4.2 `QueueJob`). Mutating operations go back through the provider,
/// not through methods on this struct — it's a read view, not a handle.
#[derive(Debug, Clone)]
pub struct QueueJob {
    pub id: String,
    pub name: String,
    pub data: JobPayload,
    pub options: JobOptions,
    pub progress: Value,
}

/// Uniform interface over the two interchangeable queue backends (§4.2).
/// A State Store Job record is created before or atomically with the
/// broker/dispatcher insertion by every implementation of `add_job`.
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Returns the caller-supplied jobId unchanged (§4.2 `addJob`).
    async fn add_job(&self, name: &str, data: JobPayload, options: JobOptions) -> core::Result<String>;

    async fn get_job(&self, job_id: &str) -> core::Result<Option<QueueJob>>;

    /// Best-effort delete from broker/dispatcher and from the State Store.
    async fn remove_job(&self, job_id: &str) -> core::Result<()>;

    /// Delegates to the State Store, the authoritative source of truth.
    async fn get_job_state(&self, job_id: &str) -> core::Result<Option<JobStatus>> {
        self.state_store().get_job_state(job_id).await
    }

    async fn get_job_result(&self, job_id: &str) -> core::Result<Option<Value>> {
        self.state_store().get_job_result(job_id).await
    }

    async fn get_job_error(&self, job_id: &str) -> core::Result<Option<String>> {
        self.state_store().get_job_error(job_id).await
    }

    /// Real counts for the broker variant; the dispatcher variant logs
    /// "not supported" and returns 0.
    async fn get_active_count(&self) -> core::Result<u64>;
    async fn get_waiting_count(&self) -> core::Result<u64>;

    /// Invoked once per terminal transition so the provider can perform
    /// its own queue-side bookkeeping (broker: remove/ack; dispatcher:
    /// no-op, since the HTTP reply already conveyed the outcome).
    async fn on_job_complete(&self, job_id: &str) -> core::Result<()>;
    async fn on_job_failed(&self, job_id: &str) -> core::Result<()>;

    fn state_store(&self) -> &Arc<dyn StateStore>;
}

/// Broker-only extension: lease-based polling (§4.2 Variant A). The
/// dispatcher variant has no equivalent — it pushes jobs to the worker
/// over HTTP instead of being polled.
#[async_trait]
pub trait LeaseQueue: QueueProvider {
    /// Pulls the next-priority waiting job and leases it to `token`.
    async fn get_next_job(&self, token: &str) -> core::Result<Option<QueueJob>>;

    /// Extends the lease on `job_id` held by `token` by `extension_ms`.
    async fn extend_lock(&self, token: &str, job_id: &str, extension_ms: u64) -> core::Result<()>;

    /// Reclaims leases whose owner has disappeared, re-queueing jobs
    /// under `max_stalled_count` and dead-lettering the rest. Intended to
    /// be invoked periodically by the worker/app crate, not per-job.
    async fn reclaim_stalled(&self) -> core::Result<Vec<String>>;
}
