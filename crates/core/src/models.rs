use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Tenant id substituted when a request carries none (§4.1 createJob).
pub const SYSTEM_TEAM_ID: &str = "system";

pub const URL_LOCK_TTL: Duration = Duration::hours(24);
pub const TEAM_JOB_TTL: Duration = Duration::minutes(10);
pub const CRAWL_TTL: Duration = Duration::hours(24);

/// Per-document result size budget before truncation kicks in. The
/// original system floated between two numbers here; this rewrite picks
/// one and makes it overridable so callers don't need to remember which.
pub const RESULT_SIZE_BUDGET_BYTES: usize = 990_000;

/// Byte budget for the crawl status read path.
pub const CRAWL_READ_BUDGET_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    SingleUrls,
    Crawl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Waiting, JobStatus::Active)
                | (JobStatus::Active, JobStatus::Completed)
                | (JobStatus::Active, JobStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    Created,
    Pending,
    Scraping,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageOptions {
    #[serde(default)]
    pub only_main_content: bool,
    #[serde(default)]
    pub include_raw_html: bool,
    #[serde(default)]
    pub include_markdown: bool,
    #[serde(default)]
    pub wait_after_load_ms: Option<u64>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// What the job is for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub url: String,
    pub mode: JobMode,
    pub team_id: String,
    #[serde(default)]
    pub page_options: PageOptions,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub crawl_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub webhook: Option<WebhookConfig>,
    /// True when this job's URL came straight from a sitemap entry rather
    /// than from link extraction on a completed page.
    #[serde(default)]
    pub is_crawl_source_url: bool,
    /// Set by the dispatcher-backed Queue Provider variant to the
    /// dispatcher's own task id; the job id itself stays canonical.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cloud_tasks_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub kind: BackoffKind,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Fixed,
}

/// How the job is scheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    pub job_id: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_priority() -> i32 {
    10
}

fn default_attempts() -> u32 {
    1
}

/// A single scrape attempt, tracked end-to-end in the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub data: JobPayload,
    pub options: JobOptions,
    pub status: JobStatus,
    /// Integer percentage, or a structured step descriptor — kept as JSON
    /// since the two shapes share no fields.
    pub progress: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: String, name: String, data: JobPayload, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            data,
            options,
            status: JobStatus::Waiting,
            progress: Value::from(0),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The root of a multi-job crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crawl {
    pub id: String,
    pub origin_url: String,
    pub crawler_options: Value,
    pub page_options: PageOptions,
    pub team_id: String,
    pub plan: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub robots_txt: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
    pub status: CrawlStatus,
    pub total_urls: u64,
    pub completed_urls: u64,
    pub failed_urls: u64,
    pub urls: Vec<String>,
    pub completed_jobs: Vec<String>,
    pub failed_jobs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Crawl {
    pub fn new(
        id: String,
        origin_url: String,
        crawler_options: Value,
        page_options: PageOptions,
        team_id: String,
        plan: String,
        robots_txt: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            origin_url,
            crawler_options,
            page_options,
            team_id,
            plan,
            robots_txt,
            cancelled: false,
            status: CrawlStatus::Created,
            total_urls: 0,
            completed_urls: 0,
            failed_urls: 0,
            urls: Vec::new(),
            completed_jobs: Vec::new(),
            failed_jobs: Vec::new(),
            start_time: None,
            end_time: None,
            created_at: now,
            expires_at: now + CRAWL_TTL,
        }
    }

    /// Finished iff at least one URL was ever queued and every queued URL
    /// has resolved to either completed or failed.
    pub fn is_finished(&self) -> bool {
        self.total_urls > 0 && self.completed_urls + self.failed_urls >= self.total_urls
    }
}

/// A create-if-absent lock guaranteeing at-most-once fan-out of a URL
/// within a crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlLock {
    pub url_hash: String,
    pub url: String,
    pub crawl_id: String,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// One record per currently-active job of a tenant, used only for
/// priority computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamJobRecord {
    pub team_id: String,
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A normalized per-URL scrape result document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    #[serde(default)]
    pub docs: Vec<Document>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub markdown: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub raw_html: Option<String>,
    pub metadata: DocumentMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub source_url: String,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

// Admin surface DTOs, carried from the teacher's health/readiness shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub services: ServiceStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub database: String,
    pub cache: Option<String>,
    pub queue: Option<String>,
}
