use core::{Config, QueueProviderKind};
use crawl::CrawlCoordinator;
use queue::{BrokerQueueProvider, DispatcherConfig, DispatcherQueueProvider, LeaseQueue, QueueProvider};
use std::sync::Arc;
use std::time::Duration;
use store::{PostgresStateStore, StateStore};
use worker::ScrapeOrchestrator;

/// Everything downstream of `Config::from_env()` — built once at process
/// startup and shared by both the `serve` and `work` subcommands.
pub struct Wiring {
    pub config: Config,
    pub state_store: Arc<dyn StateStore>,
    pub queue: Arc<dyn QueueProvider>,
    /// `Some` only for the broker-backed variant — the `work` subcommand
    /// needs lease polling, which the dispatcher variant has no notion
    /// of (it pushes jobs to `serve`'s `/tasks/process` instead).
    pub lease_queue: Option<Arc<dyn LeaseQueue>>,
    pub crawl: Arc<CrawlCoordinator>,
    pub scrape: Arc<ScrapeOrchestrator>,
}

impl Wiring {
    pub async fn build(config: Config) -> core::Result<Self> {
        let pool = store::create_pool(&config.database).await?;
        let state_store: Arc<dyn StateStore> = Arc::new(PostgresStateStore::new(pool));

        let (queue, lease_queue): (Arc<dyn QueueProvider>, Option<Arc<dyn LeaseQueue>>) = match config.queue.provider {
            QueueProviderKind::Bull => {
                let broker = Arc::new(
                    BrokerQueueProvider::connect(
                        &config.queue.broker_url,
                        state_store.clone(),
                        config.queue.queue_name.clone(),
                        config.worker.job_lock_extension_time_ms,
                        config.queue.job_ttl_secs,
                        config.queue.max_stalled_count,
                    )
                    .await?,
                );
                (broker.clone(), Some(broker))
            }
            QueueProviderKind::CloudTasks => {
                let dispatcher = Arc::new(DispatcherQueueProvider::new(
                    state_store.clone(),
                    DispatcherConfig {
                        project: config.queue.dispatcher_project.clone(),
                        location: config.queue.dispatcher_location.clone(),
                        queue: config.queue.dispatcher_queue.clone(),
                        service_url: config.queue.dispatcher_service_url.clone(),
                        service_account_email: config.queue.dispatcher_service_account_email.clone(),
                    },
                    Duration::from_secs(config.browser.timeout_secs),
                )?);
                (dispatcher, None)
            }
        };

        let crawl = Arc::new(CrawlCoordinator::new(state_store.clone(), queue.clone()));
        let scrape = Arc::new(ScrapeOrchestrator::new(config.browser.clone())?);

        Ok(Self { config, state_store, queue, lease_queue, crawl, scrape })
    }
}
