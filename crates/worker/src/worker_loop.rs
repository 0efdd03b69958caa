use crate::job_executor::JobExecutor;
use crate::resource_monitor::ResourceMonitor;
use crate::scrape_orchestrator::ScrapeOrchestrator;
use core::WorkerConfig;
use crawl::CrawlCoordinator;
use queue::{LeaseQueue, QueueJob, QueueProvider};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use store::StateStore;
use tracing::{info, warn};
use uuid::Uuid;

/// Drains the queue respecting local resource pressure, runs one scrape
/// per admitted job, keeps its lease alive while work is in flight, and
/// reliably moves it to a terminal state (C6). Only meaningful for the
/// broker queue variant — the dispatcher variant has no lease to poll
/// for and runs `JobExecutor` directly from the `/tasks/process` handler.
pub struct WorkerLoop {
    lease_queue: Arc<dyn LeaseQueue>,
    executor: Arc<JobExecutor>,
    resources: ResourceMonitor,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
}

impl WorkerLoop {
    /// `queue` and `lease_queue` must be the same underlying broker
    /// instance, coerced to the two trait objects separately by the
    /// caller (see `Wiring::build`) — there is no supertrait upcast from
    /// `Arc<dyn LeaseQueue>` alone.
    pub fn new(
        queue: Arc<dyn QueueProvider>,
        lease_queue: Arc<dyn LeaseQueue>,
        state_store: Arc<dyn StateStore>,
        crawl: Arc<CrawlCoordinator>,
        scrape: Arc<ScrapeOrchestrator>,
        config: WorkerConfig,
    ) -> Self {
        let executor = Arc::new(JobExecutor::new(queue, state_store.clone(), crawl, scrape, &config));
        Self {
            lease_queue,
            executor,
            resources: ResourceMonitor::new(Duration::from_millis(150)),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle shared with callers that need to request a graceful stop
    /// (e.g. the app crate's signal handler).
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Outer loop (§4.6). Runs until `shutdown_handle()` is flipped.
    pub async fn run(self: Arc<Self>) {
        let mut empty_polls: u32 = 0;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("worker loop shutting down");
                return;
            }

            let (cpu, ram) = self.resources.sample();
            if cpu > self.config.max_cpu || ram > self.config.max_ram {
                warn!(cpu, ram, "resource ceiling exceeded, applying backpressure");
                tokio::time::sleep(Duration::from_millis(self.config.cant_accept_connection_interval_ms)).await;
                continue;
            }

            let token = Uuid::new_v4().to_string();
            match self.lease_queue.get_next_job(&token).await {
                Ok(Some(job)) => {
                    empty_polls = 0;
                    let this = self.clone();
                    tokio::spawn(async move { this.process_job_internal(token, job).await });
                    tokio::time::sleep(Duration::from_millis(self.config.got_job_interval_ms)).await;
                }
                Ok(None) => {
                    empty_polls = empty_polls.saturating_add(1);
                    tokio::time::sleep(empty_poll_backoff(&self.config, empty_polls)).await;
                }
                Err(e) => {
                    warn!(error = %e, "get_next_job failed");
                    tokio::time::sleep(Duration::from_millis(self.config.cant_accept_connection_interval_ms)).await;
                }
            }
        }
    }

    /// Inner handler (§4.6 `processJobInternal`): wraps `JobExecutor::process`
    /// with the team-job record and lease-extension ticker.
    async fn process_job_internal(self: Arc<Self>, token: String, job: QueueJob) {
        if let Err(e) = self.executor_state_store().add_team_job(&job.data.team_id, &job.id).await {
            warn!(job_id = %job.id, error = %e, "add_team_job failed");
        }

        let ticker = self.clone().spawn_lease_ticker(token, job.id.clone());

        self.executor.process(&job).await;

        ticker.abort();
        if let Err(e) = self.executor_state_store().remove_team_job(&job.data.team_id, &job.id).await {
            warn!(job_id = %job.id, error = %e, "remove_team_job failed");
        }
    }

    fn executor_state_store(&self) -> &Arc<dyn StateStore> {
        self.lease_queue.state_store()
    }

    fn spawn_lease_ticker(self: Arc<Self>, token: String, job_id: String) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_millis(self.config.job_lock_extend_interval_ms);
        let extension_ms = self.config.job_lock_extension_time_ms;
        let lease_queue = self.lease_queue.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = lease_queue.extend_lock(&token, &job_id, extension_ms).await {
                    warn!(job_id = %job_id, error = %e, "lease extension failed, swallowing");
                }
            }
        })
    }
}

/// `min(base * 2^floor(count/MAX_EMPTY_POLLS), cap)` (§4.6 step 4).
fn empty_poll_backoff(config: &WorkerConfig, empty_polls: u32) -> Duration {
    let window = config.max_empty_polls.max(1);
    let exponent = (empty_polls / window).min(32);
    let factor = 2u64.saturating_pow(exponent);
    let ms = config.empty_poll_base_ms.saturating_mul(factor).min(config.empty_poll_cap_ms);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkerConfig {
        WorkerConfig {
            job_lock_extend_interval_ms: 30_000,
            job_lock_extension_time_ms: 120_000,
            cant_accept_connection_interval_ms: 5_000,
            connection_monitor_interval_ms: 1_000,
            got_job_interval_ms: 2_000,
            max_cpu: 0.95,
            max_ram: 0.95,
            max_empty_polls: 10,
            empty_poll_base_ms: 200,
            empty_poll_cap_ms: 30_000,
            blocked_hosts: vec!["blocked.example".to_string()],
        }
    }

    #[test]
    fn empty_poll_backoff_grows_and_caps() {
        let cfg = config();
        assert_eq!(empty_poll_backoff(&cfg, 0), Duration::from_millis(200));
        assert_eq!(empty_poll_backoff(&cfg, 9), Duration::from_millis(200));
        assert_eq!(empty_poll_backoff(&cfg, 10), Duration::from_millis(400));
        assert_eq!(empty_poll_backoff(&cfg, 20), Duration::from_millis(800));
        assert_eq!(empty_poll_backoff(&cfg, 10_000), Duration::from_millis(30_000));
    }
}
