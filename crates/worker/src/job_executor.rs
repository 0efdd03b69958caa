use crate::scrape_orchestrator::{ScrapeOrchestrator, ScrapeProgressSink, ScrapeRequest};
use async_trait::async_trait;
use core::{compute_with_fallback, PriorityRequest, WorkerConfig};
use crawl::CrawlCoordinator;
use queue::{QueueJob, QueueProvider};
use serde_json::{json, Value};
use std::sync::Arc;
use store::StateStore;
use tracing::warn;

struct JobProgressSink {
    state_store: Arc<dyn StateStore>,
    job_id: String,
}

#[async_trait]
impl ScrapeProgressSink for JobProgressSink {
    async fn on_progress(&self, doc: &core::Document) {
        let progress = json!({ "current": 1, "total": 100, "step": "SCRAPING", "url": doc.url });
        if let Err(e) = self.state_store.update_job_progress(&self.job_id, progress).await {
            warn!(job_id = %self.job_id, error = %e, "progress update failed");
        }
    }
}

/// Runs the inner-handler steps (§4.6 steps 3-8, minus the lease
/// ticker) against a plain `QueueProvider` — shared by `WorkerLoop`
/// (broker variant, which wraps this with lease extension around
/// `process`) and the `/tasks/process` webhook handler (dispatcher
/// variant, which has no lease to extend and calls `process` directly).
pub struct JobExecutor {
    queue: Arc<dyn QueueProvider>,
    state_store: Arc<dyn StateStore>,
    crawl: Arc<CrawlCoordinator>,
    scrape: Arc<ScrapeOrchestrator>,
    blocked_hosts: Vec<String>,
}

impl JobExecutor {
    pub fn new(
        queue: Arc<dyn QueueProvider>,
        state_store: Arc<dyn StateStore>,
        crawl: Arc<CrawlCoordinator>,
        scrape: Arc<ScrapeOrchestrator>,
        config: &WorkerConfig,
    ) -> Self {
        Self { queue, state_store, crawl, scrape, blocked_hosts: config.blocked_hosts.clone() }
    }

    /// Runs one job end to end (URL-block check, scrape, crawl fan-out,
    /// terminal transition) and reports what happened. The caller (the
    /// team-job record and, for the broker variant, the lease ticker)
    /// owns everything outside this boundary.
    pub async fn process(&self, job: &QueueJob) -> JobOutcome {
        if let Err(e) = self.state_store.mark_job_started(&job.id).await {
            warn!(job_id = %job.id, error = %e, "mark_job_started failed");
        }

        if self.is_blocked(&job.data.url) {
            let message = "URL is blocked by configuration".to_string();
            self.update_crawl_membership(job, false, None).await;
            let result = json!({ "success": false, "error": message });
            self.finalize(job, false, Some(message.clone()), Some(result)).await;
            return JobOutcome { success: false, error: Some(message) };
        }

        let sink: Arc<dyn ScrapeProgressSink> =
            Arc::new(JobProgressSink { state_store: self.state_store.clone(), job_id: job.id.clone() });
        if let Err(e) = self
            .state_store
            .update_job_progress(&job.id, json!({ "current": 1, "total": 100, "step": "SCRAPING", "url": "" }))
            .await
        {
            warn!(job_id = %job.id, error = %e, "initial progress update failed");
        }

        let outcome = self
            .scrape
            .run(ScrapeRequest {
                job_id: &job.id,
                mode: job.data.mode,
                url: job.data.url.clone(),
                page_options: job.data.page_options.clone(),
                progress: Some(sink),
            })
            .await;

        let success = outcome.result.success;
        self.update_crawl_membership(job, success, outcome.first_raw_html.as_deref()).await;

        let value = serde_json::to_value(&outcome.result).unwrap_or(Value::Null);
        let error = if success { None } else { Some(outcome.result.message.clone().unwrap_or_else(|| "scrape failed".to_string())) };
        self.finalize(job, success, error.clone(), Some(value)).await;
        JobOutcome { success, error }
    }

    async fn update_crawl_membership(&self, job: &QueueJob, success: bool, first_raw_html: Option<&str>) {
        let Some(crawl_id) = job.data.crawl_id.clone() else {
            return;
        };

        let priority = if success {
            match self.state_store.get_crawl(&crawl_id).await {
                Ok(Some(crawl)) => {
                    let req = PriorityRequest {
                        plan: &crawl.plan,
                        team_id: Some(&crawl.team_id),
                        base_priority: job.options.priority,
                    };
                    let store = self.state_store.clone();
                    compute_with_fallback(&req, |team_id| async move { store.get_team_job_count(&team_id).await }).await
                }
                _ => job.options.priority,
            }
        } else {
            job.options.priority
        };

        let raw_html = if success && !job.data.is_crawl_source_url { first_raw_html } else { None };

        if let Err(e) = self
            .crawl
            .handle_child_completion(&crawl_id, &job.id, success, &job.data.url, raw_html, priority)
            .await
        {
            warn!(crawl_id, job_id = %job.id, error = %e, "crawl membership update failed");
        }
    }

    async fn finalize(&self, job: &QueueJob, success: bool, error: Option<String>, result: Option<Value>) {
        if success {
            let result = result.unwrap_or(Value::Null);
            match self.state_store.mark_job_completed(&job.id, result.clone()).await {
                Ok(()) => {
                    let _ = self.queue.on_job_complete(&job.id).await;
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "mark_job_completed failed, applying fallback");
                    if self.state_store.update_job_progress(&job.id, json!(100)).await.is_err()
                        || self.state_store.mark_job_completed(&job.id, result).await.is_err()
                    {
                        let _ = self.queue.remove_job(&job.id).await;
                    }
                }
            }
        } else {
            let message = error.unwrap_or_else(|| "unknown error".to_string());
            match self.state_store.mark_job_failed(&job.id, &message).await {
                Ok(()) => {
                    let _ = self.queue.on_job_failed(&job.id).await;
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "mark_job_failed failed, removing from queue");
                    let _ = self.queue.remove_job(&job.id).await;
                }
            }
        }
    }

    fn is_blocked(&self, raw_url: &str) -> bool {
        if self.blocked_hosts.is_empty() {
            return false;
        }
        let Ok(parsed) = url::Url::parse(raw_url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        self.blocked_hosts
            .iter()
            .any(|blocked| !blocked.is_empty() && (host == blocked || host.ends_with(&format!(".{blocked}"))))
    }
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub success: bool,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::WorkerConfig;

    fn config(blocked: Vec<String>) -> WorkerConfig {
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
            blocked_hosts: blocked,
        }
    }

    fn is_blocked_standalone(blocked_hosts: &[String], raw_url: &str) -> bool {
        if blocked_hosts.is_empty() {
            return false;
        }
        let Ok(parsed) = url::Url::parse(raw_url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        blocked_hosts.iter().any(|blocked| !blocked.is_empty() && (host == blocked || host.ends_with(&format!(".{blocked}"))))
    }

    #[test]
    fn block_list_matches_host_and_subdomains() {
        let cfg = config(vec!["blocked.example".to_string()]);
        assert!(is_blocked_standalone(&cfg.blocked_hosts, "https://blocked.example/x"));
        assert!(is_blocked_standalone(&cfg.blocked_hosts, "https://sub.blocked.example/x"));
        assert!(!is_blocked_standalone(&cfg.blocked_hosts, "https://allowed.example/x"));
    }

    #[test]
    fn empty_block_list_blocks_nothing() {
        let cfg = config(vec![]);
        assert!(!is_blocked_standalone(&cfg.blocked_hosts, "https://anything.example/x"));
    }
}
