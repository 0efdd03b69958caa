pub mod job_executor;
pub mod resource_monitor;
pub mod scrape_orchestrator;
pub mod worker_loop;

pub use job_executor::{JobExecutor, JobOutcome};
pub use resource_monitor::ResourceMonitor;
pub use scrape_orchestrator::{ScrapeOrchestrator, ScrapeOutcome, ScrapeProgressSink, ScrapeRequest};
pub use worker_loop::WorkerLoop;
