pub mod links;

use core::{AppError, Crawl, JobMode, JobOptions, JobPayload, PageOptions};
use queue::QueueProvider;
use serde_json::Value;
use std::sync::Arc;
use store::StateStore;
use tracing::{info, warn};
use uuid::Uuid;

pub use links::extract_links;

/// Coordinates a multi-URL crawl across the State Store and the Queue
/// Provider (§4.5). Holds no state of its own beyond the two handles —
/// the crawl's actual state lives in the `crawls`/`crawl_jobs` tables and
/// is always read back before a decision is made, so two coordinator
/// instances (e.g. one per worker process) agree without coordination.
pub struct CrawlCoordinator {
    state_store: Arc<dyn StateStore>,
    queue: Arc<dyn QueueProvider>,
}

/// Name under which crawl-originated scrape jobs are enqueued.
pub const CRAWL_JOB_NAME: &str = "scrape";

impl CrawlCoordinator {
    pub fn new(state_store: Arc<dyn StateStore>, queue: Arc<dyn QueueProvider>) -> Self {
        Self { state_store, queue }
    }

    /// Creates the crawl record and returns its id. Does not enqueue the
    /// seed URL itself — callers enqueue the origin URL via
    /// [`CrawlCoordinator::enqueue_urls`] immediately after, the same way
    /// any other discovered link would be enqueued, so the origin goes
    /// through the identical lock-and-count bookkeeping.
    pub async fn start_crawl(
        &self,
        origin_url: String,
        crawler_options: Value,
        page_options: PageOptions,
        team_id: String,
        plan: String,
        robots_txt: Option<String>,
    ) -> core::Result<Crawl> {
        let crawl_id = Uuid::new_v4().to_string();
        let crawl = Crawl::new(crawl_id, origin_url, crawler_options, page_options, team_id, plan, robots_txt);
        self.state_store.save_crawl(&crawl).await?;
        info!(crawl_id = %crawl.id, "crawl created");
        Ok(crawl)
    }

    /// Locks each candidate URL and enqueues only the ones newly claimed,
    /// skipping URLs some other fan-out already locked for this crawl
    /// (§3 at-most-once-per-crawl invariant). Returns the job ids actually
    /// enqueued, in the same order as `urls` (minus skips).
    pub async fn enqueue_urls(
        &self,
        crawl: &Crawl,
        urls: &[String],
        priority: i32,
        is_crawl_source_url: bool,
    ) -> core::Result<Vec<String>> {
        let mut enqueued = Vec::with_capacity(urls.len());

        for url in urls {
            if !self.state_store.lock_url(url, &crawl.id).await? {
                continue;
            }

            let job_id = Uuid::new_v4().to_string();
            let data = JobPayload {
                url: url.clone(),
                mode: JobMode::Crawl,
                team_id: crawl.team_id.clone(),
                page_options: crawl.page_options.clone(),
                crawl_id: Some(crawl.id.clone()),
                webhook: None,
                is_crawl_source_url,
                cloud_tasks_id: None,
            };
            let options = JobOptions {
                job_id: job_id.clone(),
                priority,
                attempts: 1,
                backoff: Default::default(),
            };

            self.queue.add_job(CRAWL_JOB_NAME, data, options).await?;
            self.state_store.add_crawl_job(&crawl.id, &job_id).await?;
            enqueued.push(job_id);
        }

        Ok(enqueued)
    }

    /// Handles the aftermath of one child job resolving (§4.5/§4.6 crawl
    /// fan-out). Records the outcome, extracts links from the page's raw
    /// HTML when available, enqueues the newly discovered URLs under the
    /// given priority, then checks whether the crawl as a whole is done.
    ///
    /// `raw_html` is `None` when the job failed, was blocked, or the page
    /// options didn't request raw HTML — in all those cases no further
    /// URLs are discovered from this child.
    pub async fn handle_child_completion(
        &self,
        crawl_id: &str,
        job_id: &str,
        success: bool,
        source_url: &str,
        raw_html: Option<&str>,
        priority: i32,
    ) -> core::Result<Vec<String>> {
        self.state_store.add_crawl_job_done(crawl_id, job_id, success).await?;

        let mut discovered = Vec::new();
        if success {
            if let Some(crawl) = self.state_store.get_crawl(crawl_id).await? {
                if !crawl.cancelled {
                    if let Some(html) = raw_html {
                        let links = links::extract_links(html, source_url);
                        if !links.is_empty() {
                            discovered = self.enqueue_urls(&crawl, &links, priority, false).await?;
                        }
                    }
                } else {
                    info!(crawl_id, "crawl cancelled, skipping link fan-out");
                }
            }
        }

        self.finish_if_done(crawl_id).await?;
        Ok(discovered)
    }

    /// Idempotent: safe to call after every child resolution. The State
    /// Store itself guards the actual `completed` transition against
    /// double-firing; this just gives callers a cheap way to trigger the
    /// check without duplicating the finished-ness arithmetic.
    async fn finish_if_done(&self, crawl_id: &str) -> core::Result<()> {
        if self.state_store.is_crawl_finished(crawl_id).await? {
            self.state_store.finish_crawl(crawl_id).await?;
        }
        Ok(())
    }

    pub async fn cancel(&self, crawl_id: &str) -> core::Result<()> {
        let Some(mut crawl) = self.state_store.get_crawl(crawl_id).await? else {
            return Err(AppError::NotFound(format!("crawl {crawl_id} not found")));
        };
        crawl.cancelled = true;
        self.state_store.save_crawl(&crawl).await
    }

    /// Byte-budgeted read path for crawl status (§4.5): walks the
    /// completed-job id list in pages of 100, fetching each job's result
    /// and accumulating its serialized size, and stops as soon as adding
    /// the next result would cross `core::CRAWL_READ_BUDGET_BYTES` — the
    /// element that crossed the budget is itself discarded, so the
    /// returned payload never exceeds it.
    pub async fn get_crawl_results(&self, crawl_id: &str, start: i64) -> core::Result<Vec<Value>> {
        const PAGE_SIZE: i64 = 100;
        let mut results = Vec::new();
        let mut accumulated_bytes = 0usize;
        let mut offset = start;

        'paging: loop {
            let page_end = offset + PAGE_SIZE - 1;
            let ids = self.state_store.get_done_jobs_ordered(crawl_id, offset, Some(page_end)).await?;
            if ids.is_empty() {
                break;
            }
            let page_len = ids.len() as i64;

            for job_id in ids {
                let Some(result) = self.state_store.get_job_result(&job_id).await? else {
                    continue;
                };
                let size = serde_json::to_vec(&result).map(|v| v.len()).unwrap_or(0);
                if accumulated_bytes + size > core::CRAWL_READ_BUDGET_BYTES {
                    warn!(crawl_id, "crawl result read hit byte budget, truncating response");
                    break 'paging;
                }
                accumulated_bytes += size;
                results.push(result);
            }

            if page_len < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use core::{Job, JobStatus};
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        crawls: Mutex<StdHashMap<String, Crawl>>,
        locks: Mutex<std::collections::HashSet<String>>,
        crawl_jobs: Mutex<StdHashMap<String, Vec<(String, bool, bool)>>>,
        results: Mutex<StdHashMap<String, Value>>,
    }

    #[async_trait]
    impl StateStore for FakeStore {
        async fn create_job(&self, _job: &Job) -> core::Result<()> {
            Ok(())
        }
        async fn mark_job_started(&self, _job_id: &str) -> core::Result<()> {
            Ok(())
        }
        async fn mark_job_completed(&self, _job_id: &str, _result: Value) -> core::Result<()> {
            Ok(())
        }
        async fn mark_job_failed(&self, _job_id: &str, _error: &str) -> core::Result<()> {
            Ok(())
        }
        async fn update_job_progress(&self, _job_id: &str, _progress: Value) -> core::Result<()> {
            Ok(())
        }
        async fn get_job_state(&self, _job_id: &str) -> core::Result<Option<JobStatus>> {
            Ok(None)
        }
        async fn get_job_result(&self, job_id: &str) -> core::Result<Option<Value>> {
            Ok(self.results.lock().unwrap().get(job_id).cloned())
        }
        async fn get_job_error(&self, _job_id: &str) -> core::Result<Option<String>> {
            Ok(None)
        }
        async fn get_job_data(&self, _job_id: &str) -> core::Result<Option<Job>> {
            Ok(None)
        }
        async fn remove_job(&self, _job_id: &str) -> core::Result<()> {
            Ok(())
        }
        async fn save_crawl(&self, crawl: &Crawl) -> core::Result<()> {
            self.crawls.lock().unwrap().insert(crawl.id.clone(), crawl.clone());
            Ok(())
        }
        async fn get_crawl(&self, crawl_id: &str) -> core::Result<Option<Crawl>> {
            Ok(self.crawls.lock().unwrap().get(crawl_id).cloned())
        }
        async fn get_crawl_expiry(&self, _crawl_id: &str) -> core::Result<Option<DateTime<Utc>>> {
            Ok(None)
        }
        async fn add_crawl_job(&self, crawl_id: &str, job_id: &str) -> core::Result<()> {
            self.crawl_jobs
                .lock()
                .unwrap()
                .entry(crawl_id.to_string())
                .or_default()
                .push((job_id.to_string(), false, false));
            let mut crawls = self.crawls.lock().unwrap();
            if let Some(c) = crawls.get_mut(crawl_id) {
                c.total_urls += 1;
            }
            Ok(())
        }
        async fn add_crawl_jobs(&self, crawl_id: &str, job_ids: &[String]) -> core::Result<()> {
            for id in job_ids {
                self.add_crawl_job(crawl_id, id).await?;
            }
            Ok(())
        }
        async fn add_crawl_job_done(&self, crawl_id: &str, job_id: &str, success: bool) -> core::Result<()> {
            let mut jobs = self.crawl_jobs.lock().unwrap();
            if let Some(list) = jobs.get_mut(crawl_id) {
                for entry in list.iter_mut() {
                    if entry.0 == job_id {
                        entry.1 = true;
                        entry.2 = success;
                    }
                }
            }
            let mut crawls = self.crawls.lock().unwrap();
            if let Some(c) = crawls.get_mut(crawl_id) {
                if success {
                    c.completed_urls += 1;
                } else {
                    c.failed_urls += 1;
                }
            }
            Ok(())
        }
        async fn get_done_jobs_ordered_length(&self, crawl_id: &str) -> core::Result<u64> {
            Ok(self
                .crawl_jobs
                .lock()
                .unwrap()
                .get(crawl_id)
                .map(|l| l.iter().filter(|e| e.1).count() as u64)
                .unwrap_or(0))
        }
        async fn get_done_jobs_ordered(&self, crawl_id: &str, start: i64, end: Option<i64>) -> core::Result<Vec<String>> {
            let jobs = self.crawl_jobs.lock().unwrap();
            let Some(list) = jobs.get(crawl_id) else {
                return Ok(Vec::new());
            };
            let done: Vec<String> = list.iter().filter(|e| e.1).map(|e| e.0.clone()).collect();
            let start = start.max(0) as usize;
            let end = end.map(|e| (e.max(0) as usize) + 1).unwrap_or(done.len());
            Ok(done.into_iter().skip(start).take(end.saturating_sub(start)).collect())
        }
        async fn is_crawl_finished(&self, crawl_id: &str) -> core::Result<bool> {
            Ok(self.crawls.lock().unwrap().get(crawl_id).map(|c| c.is_finished()).unwrap_or(false))
        }
        async fn finish_crawl(&self, crawl_id: &str) -> core::Result<()> {
            if let Some(c) = self.crawls.lock().unwrap().get_mut(crawl_id) {
                c.status = core::CrawlStatus::Completed;
            }
            Ok(())
        }
        async fn lock_url(&self, url: &str, crawl_id: &str) -> core::Result<bool> {
            let key = format!("{crawl_id}:{url}");
            Ok(self.locks.lock().unwrap().insert(key))
        }
        async fn lock_urls(&self, crawl_id: &str, urls: &[String]) -> core::Result<bool> {
            let mut ok = true;
            for u in urls {
                if !self.lock_url(u, crawl_id).await? {
                    ok = false;
                }
            }
            Ok(ok)
        }
        async fn add_team_job(&self, _team_id: &str, _job_id: &str) -> core::Result<()> {
            Ok(())
        }
        async fn remove_team_job(&self, _team_id: &str, _job_id: &str) -> core::Result<()> {
            Ok(())
        }
        async fn get_team_job_count(&self, _team_id: &str) -> core::Result<u64> {
            Ok(0)
        }
    }

    struct FakeQueue {
        store: Arc<dyn StateStore>,
    }

    #[async_trait]
    impl QueueProvider for FakeQueue {
        async fn add_job(&self, _name: &str, _data: JobPayload, _options: JobOptions) -> core::Result<String> {
            Ok(Uuid::new_v4().to_string())
        }
        async fn get_job(&self, _job_id: &str) -> core::Result<Option<queue::QueueJob>> {
            Ok(None)
        }
        async fn remove_job(&self, _job_id: &str) -> core::Result<()> {
            Ok(())
        }
        async fn get_active_count(&self) -> core::Result<u64> {
            Ok(0)
        }
        async fn get_waiting_count(&self) -> core::Result<u64> {
            Ok(0)
        }
        async fn on_job_complete(&self, _job_id: &str) -> core::Result<()> {
            Ok(())
        }
        async fn on_job_failed(&self, _job_id: &str) -> core::Result<()> {
            Ok(())
        }
        fn state_store(&self) -> &Arc<dyn StateStore> {
            &self.store
        }
    }

    fn coordinator() -> (CrawlCoordinator, Arc<FakeStore>) {
        let store = Arc::new(FakeStore::default());
        let queue: Arc<dyn QueueProvider> = Arc::new(FakeQueue { store: store.clone() });
        (CrawlCoordinator::new(store.clone(), queue), store)
    }

    #[tokio::test]
    async fn start_crawl_persists_a_created_record() {
        let (coord, store) = coordinator();
        let crawl = coord
            .start_crawl(
                "https://example.com".into(),
                json!({}),
                PageOptions::default(),
                "team-1".into(),
                "free".into(),
                None,
            )
            .await
            .unwrap();
        assert!(store.get_crawl(&crawl.id).await.unwrap().is_some());
        assert_eq!(crawl.status, core::CrawlStatus::Created);
    }

    #[tokio::test]
    async fn enqueue_urls_skips_already_locked_urls() {
        let (coord, store) = coordinator();
        let crawl = coord
            .start_crawl("https://example.com".into(), json!({}), PageOptions::default(), "t".into(), "free".into(), None)
            .await
            .unwrap();

        let urls = vec!["https://example.com/a".to_string(), "https://example.com/a".to_string()];
        let crawl = store.get_crawl(&crawl.id).await.unwrap().unwrap();
        let enqueued = coord.enqueue_urls(&crawl, &urls, 10, false).await.unwrap();
        assert_eq!(enqueued.len(), 1);
    }

    #[tokio::test]
    async fn handle_child_completion_finishes_crawl_when_all_done() {
        let (coord, store) = coordinator();
        let crawl = coord
            .start_crawl("https://example.com".into(), json!({}), PageOptions::default(), "t".into(), "free".into(), None)
            .await
            .unwrap();
        let crawl = store.get_crawl(&crawl.id).await.unwrap().unwrap();
        let enqueued = coord.enqueue_urls(&crawl, &["https://example.com/seed".into()], 10, true).await.unwrap();
        let job_id = &enqueued[0];

        coord
            .handle_child_completion(&crawl.id, job_id, true, "https://example.com/seed", None, 10)
            .await
            .unwrap();

        let updated = store.get_crawl(&crawl.id).await.unwrap().unwrap();
        assert_eq!(updated.status, core::CrawlStatus::Completed);
    }

    #[tokio::test]
    async fn handle_child_completion_extracts_and_enqueues_links() {
        let (coord, store) = coordinator();
        let crawl = coord
            .start_crawl("https://example.com".into(), json!({}), PageOptions::default(), "t".into(), "free".into(), None)
            .await
            .unwrap();
        let crawl = store.get_crawl(&crawl.id).await.unwrap().unwrap();
        let enqueued = coord.enqueue_urls(&crawl, &["https://example.com/seed".into()], 10, true).await.unwrap();
        let job_id = &enqueued[0];

        let html = r#"<a href="/child">child</a>"#;
        let discovered = coord
            .handle_child_completion(&crawl.id, job_id, true, "https://example.com/seed", Some(html), 10)
            .await
            .unwrap();

        assert_eq!(discovered.len(), 1);
        let updated = store.get_crawl(&crawl.id).await.unwrap().unwrap();
        assert_eq!(updated.total_urls, 2);
    }

    #[tokio::test]
    async fn get_crawl_results_respects_byte_budget() {
        let (coord, store) = coordinator();
        let crawl = coord
            .start_crawl("https://example.com".into(), json!({}), PageOptions::default(), "t".into(), "free".into(), None)
            .await
            .unwrap();
        let crawl_id = crawl.id.clone();

        let big = "x".repeat(core::CRAWL_READ_BUDGET_BYTES);
        for i in 0..3 {
            let job_id = format!("job-{i}");
            store.add_crawl_job(&crawl_id, &job_id).await.unwrap();
            store.add_crawl_job_done(&crawl_id, &job_id, true).await.unwrap();
            store.results.lock().unwrap().insert(job_id, json!({ "content": big }));
        }

        let results = coord.get_crawl_results(&crawl_id, 0).await.unwrap();
        assert_eq!(results.len(), 1);
    }
}
