use crate::{QueueJob, QueueProvider};
use async_trait::async_trait;
use core::{AppError, Job, JobOptions, JobPayload};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use store::StateStore;
use tracing::{info, warn};

/// Configuration for the task-dispatcher-backed variant (§4.2 Variant B
/// — modeled on a cloud task-queue service: dispatcher owns scheduling
/// and retry, the worker is passive and receives jobs as HTTP requests).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub project: String,
    pub location: String,
    pub queue: String,
    pub service_url: String,
    pub service_account_email: String,
}

pub struct DispatcherQueueProvider {
    client: reqwest::Client,
    state_store: Arc<dyn StateStore>,
    config: DispatcherConfig,
}

/// Body shape of the `/tasks/process` webhook (§6 wire contract). The
/// dispatcher itself may transport this opaquely (e.g. base64) between
/// the enqueue call and the worker's HTTP endpoint — that's an
/// implementation detail of whatever managed task queue sits in
/// between, invisible on either side of this interface.
#[derive(Serialize)]
struct TaskEnvelope {
    name: String,
    data: JobPayload,
    options: JobOptions,
}

impl DispatcherQueueProvider {
    pub fn new(state_store: Arc<dyn StateStore>, config: DispatcherConfig, request_timeout: Duration) -> core::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(AppError::Http)?;
        Ok(Self { client, state_store, config })
    }

    fn task_endpoint(&self) -> String {
        format!("{}/tasks/process", self.config.service_url.trim_end_matches('/'))
    }

    /// Synthesizes a task id in the shape of the managed dispatcher's own
    /// identifiers, since there is no real cloud task queue behind this
    /// implementation.
    fn synthesize_task_id(&self, job_id: &str) -> String {
        format!(
            "projects/{}/locations/{}/queues/{}/tasks/{}",
            self.config.project, self.config.location, self.config.queue, job_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(state_store: Arc<dyn StateStore>) -> DispatcherQueueProvider {
        DispatcherQueueProvider::new(
            state_store,
            DispatcherConfig {
                project: "proj".to_string(),
                location: "us-central1".to_string(),
                queue: "scrape".to_string(),
                service_url: "https://worker.example/".to_string(),
                service_account_email: "svc@proj.iam.gserviceaccount.com".to_string(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    struct NoopStore;
    #[async_trait]
    impl StateStore for NoopStore {
        async fn create_job(&self, _job: &core::Job) -> core::Result<()> {
            unimplemented!()
        }
        async fn mark_job_started(&self, _job_id: &str) -> core::Result<()> {
            unimplemented!()
        }
        async fn mark_job_completed(&self, _job_id: &str, _result: serde_json::Value) -> core::Result<()> {
            unimplemented!()
        }
        async fn mark_job_failed(&self, _job_id: &str, _error: &str) -> core::Result<()> {
            unimplemented!()
        }
        async fn update_job_progress(&self, _job_id: &str, _progress: serde_json::Value) -> core::Result<()> {
            unimplemented!()
        }
        async fn get_job_state(&self, _job_id: &str) -> core::Result<Option<core::JobStatus>> {
            unimplemented!()
        }
        async fn get_job_result(&self, _job_id: &str) -> core::Result<Option<serde_json::Value>> {
            unimplemented!()
        }
        async fn get_job_error(&self, _job_id: &str) -> core::Result<Option<String>> {
            unimplemented!()
        }
        async fn get_job_data(&self, _job_id: &str) -> core::Result<Option<core::Job>> {
            unimplemented!()
        }
        async fn remove_job(&self, _job_id: &str) -> core::Result<()> {
            unimplemented!()
        }
        async fn save_crawl(&self, _crawl: &core::Crawl) -> core::Result<()> {
            unimplemented!()
        }
        async fn get_crawl(&self, _crawl_id: &str) -> core::Result<Option<core::Crawl>> {
            unimplemented!()
        }
        async fn get_crawl_expiry(&self, _crawl_id: &str) -> core::Result<Option<chrono::DateTime<chrono::Utc>>> {
            unimplemented!()
        }
        async fn add_crawl_job(&self, _crawl_id: &str, _job_id: &str) -> core::Result<()> {
            unimplemented!()
        }
        async fn add_crawl_jobs(&self, _crawl_id: &str, _job_ids: &[String]) -> core::Result<()> {
            unimplemented!()
        }
        async fn add_crawl_job_done(&self, _crawl_id: &str, _job_id: &str, _success: bool) -> core::Result<()> {
            unimplemented!()
        }
        async fn get_done_jobs_ordered_length(&self, _crawl_id: &str) -> core::Result<u64> {
            unimplemented!()
        }
        async fn get_done_jobs_ordered(&self, _crawl_id: &str, _start: i64, _end: Option<i64>) -> core::Result<Vec<String>> {
            unimplemented!()
        }
        async fn is_crawl_finished(&self, _crawl_id: &str) -> core::Result<bool> {
            unimplemented!()
        }
        async fn finish_crawl(&self, _crawl_id: &str) -> core::Result<()> {
            unimplemented!()
        }
        async fn lock_url(&self, _url: &str, _crawl_id: &str) -> core::Result<bool> {
            unimplemented!()
        }
        async fn lock_urls(&self, _crawl_id: &str, _urls: &[String]) -> core::Result<bool> {
            unimplemented!()
        }
        async fn add_team_job(&self, _team_id: &str, _job_id: &str) -> core::Result<()> {
            unimplemented!()
        }
        async fn remove_team_job(&self, _team_id: &str, _job_id: &str) -> core::Result<()> {
            unimplemented!()
        }
        async fn get_team_job_count(&self, _team_id: &str) -> core::Result<u64> {
            unimplemented!()
        }
    }

    #[test]
    fn task_endpoint_strips_trailing_slash() {
        let provider = provider(Arc::new(NoopStore));
        assert_eq!(provider.task_endpoint(), "https://worker.example/tasks/process");
    }

    #[test]
    fn synthesize_task_id_embeds_dispatcher_coordinates() {
        let provider = provider(Arc::new(NoopStore));
        assert_eq!(
            provider.synthesize_task_id("job-1"),
            "projects/proj/locations/us-central1/queues/scrape/tasks/job-1"
        );
    }
}

#[async_trait]
impl QueueProvider for DispatcherQueueProvider {
    async fn add_job(&self, name: &str, data: JobPayload, options: JobOptions) -> core::Result<String> {
        let job_id = options.job_id.clone();
        let cloud_tasks_id = self.synthesize_task_id(&job_id);

        let mut data = data;
        data.cloud_tasks_id = Some(cloud_tasks_id.clone());

        let job = Job::new(job_id.clone(), name.to_string(), data, options.clone());
        self.state_store.create_job(&job).await?;

        let envelope = TaskEnvelope { name: name.to_string(), data: job.data, options };

        let response = self
            .client
            .post(self.task_endpoint())
            .header("X-CloudTasks-TaskName", &cloud_tasks_id)
            .header("X-CloudTasks-QueueName", &self.config.queue)
            .json(&envelope)
            .send()
            .await
            .map_err(AppError::Http)?;

        if !response.status().is_success() {
            warn!(job_id, status = %response.status(), "dispatcher task submission failed");
            return Err(AppError::QueueUnavailable(format!(
                "dispatcher rejected task for job {job_id}: {}",
                response.status()
            )));
        }

        info!(job_id, cloud_tasks_id, "dispatched task");
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
        // The dispatcher has no cancel-in-flight primitive wired up here;
        // best-effort means dropping the durable record so a delayed
        // delivery is treated as orphaned by the worker.
        self.state_store.remove_job(job_id).await
    }

    async fn get_active_count(&self) -> core::Result<u64> {
        warn!("get_active_count is not supported by the dispatcher queue provider");
        Ok(0)
    }

    async fn get_waiting_count(&self) -> core::Result<u64> {
        warn!("get_waiting_count is not supported by the dispatcher queue provider");
        Ok(0)
    }

    async fn on_job_complete(&self, _job_id: &str) -> core::Result<()> {
        // The HTTP reply to `/tasks/process` already conveyed the
        // outcome to the dispatcher; nothing further to acknowledge.
        Ok(())
    }

    async fn on_job_failed(&self, _job_id: &str) -> core::Result<()> {
        Ok(())
    }

    fn state_store(&self) -> &Arc<dyn StateStore> {
        &self.state_store
    }
}
