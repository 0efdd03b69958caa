use crate::wiring::Wiring;
use std::sync::Arc;
use tracing::info;
use worker::WorkerLoop;

/// Runs one `WorkerLoop` instance until a shutdown signal arrives.
/// Requires the broker queue variant — the dispatcher variant has no
/// lease to poll and is served entirely by `serve`'s `/tasks/process`.
pub async fn run(wiring: Wiring) -> core::Result<()> {
    let Some(lease_queue) = wiring.lease_queue.clone() else {
        return Err(core::AppError::Config(
            "the `work` subcommand requires QUEUE_PROVIDER=bull; the cloud-tasks variant is served by `serve`".to_string(),
        ));
    };

    let worker_loop = Arc::new(WorkerLoop::new(
        wiring.queue.clone(),
        lease_queue,
        wiring.state_store.clone(),
        wiring.crawl.clone(),
        wiring.scrape.clone(),
        wiring.config.worker.clone(),
    ));

    let shutdown = worker_loop.shutdown_handle();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, stopping worker loop");
        shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    });

    worker_loop.run().await;
    Ok(())
}
