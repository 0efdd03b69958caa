use async_trait::async_trait;
use core::{AppError, BrowserConfig, Document, DocumentMetadata, JobMode, PageOptions, ScrapeResult};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Per-fetched-URL progress notification (§4.7 `onProgress`), capped by
/// the orchestrator to one call per URL regardless of document
/// retention.
#[async_trait]
pub trait ScrapeProgressSink: Send + Sync {
    async fn on_progress(&self, doc: &Document);
}

/// Input to a single scrape pipeline invocation (§4.7 `runWebScraper`).
pub struct ScrapeRequest<'a> {
    pub job_id: &'a str,
    pub mode: JobMode,
    /// Raw `data.url` field: a single URL in crawl mode, or a
    /// comma-separated list in single_urls mode.
    pub url: String,
    pub page_options: PageOptions,
    pub progress: Option<Arc<dyn ScrapeProgressSink>>,
}

/// Result of running the pipeline, plus the first document's raw HTML
/// captured unconditionally for the caller's crawl-fan-out link
/// extraction — independent of whether `page_options.include_raw_html`
/// asked for raw HTML in the returned, user-facing document.
pub struct ScrapeOutcome {
    pub result: ScrapeResult,
    pub first_raw_html: Option<String>,
}

const MAX_RETAINED_DOCS: usize = 50;

#[derive(Debug, Deserialize, Default)]
struct BrowserResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    html: Option<String>,
    #[serde(default, rename = "pageStatusCode")]
    page_status_code: Option<u16>,
    #[serde(default)]
    status: Option<u16>,
    #[serde(default, rename = "pageError")]
    page_error: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl BrowserResponse {
    fn body(&self) -> Option<&str> {
        self.content.as_deref().or(self.html.as_deref())
    }

    fn failure(&self) -> Option<&str> {
        self.page_error.as_deref().or(self.error.as_deref())
    }
}

/// Wraps the external headless-browser microservice call and normalizes
/// its response into the shared `Document` shape (C7).
pub struct ScrapeOrchestrator {
    client: Client,
    config: BrowserConfig,
}

impl ScrapeOrchestrator {
    pub fn new(config: BrowserConfig) -> core::Result<Self> {
        let client = Client::builder().build().map_err(AppError::Http)?;
        Ok(Self { client, config })
    }

    fn seed_urls(&self, request: &ScrapeRequest<'_>) -> Vec<String> {
        match request.mode {
            JobMode::Crawl => vec![request.url.clone()],
            JobMode::SingleUrls => request
                .url
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub async fn run(&self, request: ScrapeRequest<'_>) -> ScrapeOutcome {
        let urls = self.seed_urls(&request);
        if urls.is_empty() {
            return ScrapeOutcome {
                result: ScrapeResult {
                    success: false,
                    message: Some("no URL to scrape".to_string()),
                    docs: Vec::new(),
                },
                first_raw_html: None,
            };
        }

        let mut docs = Vec::new();
        let mut first_raw_html = None;
        let mut last_failure = None;

        for url in &urls {
            match self.fetch_with_retry(url, &request.page_options).await {
                Ok(html) => {
                    if first_raw_html.is_none() {
                        first_raw_html = Some(html.clone());
                    }
                    let doc = self.normalize(url, &html, &request.page_options);
                    if let Some(sink) = &request.progress {
                        sink.on_progress(&doc).await;
                    }
                    if docs.len() < MAX_RETAINED_DOCS {
                        docs.push(doc);
                    }
                }
                Err(e) => {
                    warn!(url, job_id = request.job_id, error = %e, "scrape attempt exhausted retries");
                    last_failure = Some(e);
                }
            }
        }

        if docs.is_empty() {
            let message = last_failure.unwrap_or_else(|| "no documents scraped".to_string());
            return ScrapeOutcome {
                result: ScrapeResult { success: false, message: Some(message), docs: Vec::new() },
                first_raw_html,
            };
        }

        ScrapeOutcome {
            result: ScrapeResult { success: true, message: None, docs },
            first_raw_html,
        }
    }

    /// Strips internal provider fields (`index`, `provider`) by simply
    /// never copying them in, and applies the page-options toggles for
    /// which heavy fields make it into the stored document.
    fn normalize(&self, url: &str, html: &str, page_options: &PageOptions) -> Document {
        Document {
            url: url.to_string(),
            title: None,
            content: Some(html.to_string()),
            markdown: if page_options.include_markdown { Some(html.to_string()) } else { None },
            raw_html: if page_options.include_raw_html { Some(html.to_string()) } else { None },
            metadata: DocumentMetadata { source_url: url.to_string(), extra: Default::default() },
        }
    }

    async fn fetch_with_retry(&self, url: &str, page_options: &PageOptions) -> Result<String, String> {
        let wait_ms = page_options.wait_after_load_ms.unwrap_or(0);
        let timeout = Duration::from_secs(self.config.timeout_secs) + Duration::from_millis(wait_ms);

        let mut last_err = String::new();
        for attempt in 0..=self.config.max_retries {
            match self.fetch_once(url, wait_ms, page_options, timeout).await {
                Ok(html) => return Ok(html),
                Err(e) => {
                    last_err = e;
                    if attempt < self.config.max_retries {
                        tokio::time::sleep(Duration::from_millis(self.config.retry_gap_ms)).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn fetch_once(&self, url: &str, wait_ms: u64, page_options: &PageOptions, timeout: Duration) -> Result<String, String> {
        let mut builder = self.client.post(&self.config.url).timeout(timeout).json(&json!({
            "url": url,
            "wait_after_load": wait_ms,
            "headers": page_options.headers,
        }));
        if let Some(token) = identity_token() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("browser microservice returned {}", response.status()));
        }

        let parsed: BrowserResponse = response.json().await.map_err(|e| e.to_string())?;
        if let Some(err) = parsed.failure() {
            return Err(err.to_string());
        }
        parsed
            .body()
            .map(str::to_string)
            .ok_or_else(|| "browser microservice returned no content".to_string())
    }
}

/// Cloud identity token for authenticating to the browser microservice:
/// fetched from a metadata service in production, a local identity tool
/// otherwise. Neither integration is wired up here — this reads whatever
/// the environment already carries, leaving the actual token minting to
/// deployment-specific tooling outside this crate.
fn identity_token() -> Option<String> {
    std::env::var("BROWSER_IDENTITY_TOKEN").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BrowserConfig {
        BrowserConfig { url: "http://localhost:0".to_string(), timeout_secs: 1, max_retries: 0, retry_gap_ms: 0 }
    }

    #[test]
    fn seed_urls_splits_single_urls_mode_on_commas() {
        let orchestrator = ScrapeOrchestrator::new(config()).unwrap();
        let request = ScrapeRequest {
            job_id: "j1",
            mode: JobMode::SingleUrls,
            url: "https://a.example, https://b.example ,".to_string(),
            page_options: PageOptions::default(),
            progress: None,
        };
        assert_eq!(orchestrator.seed_urls(&request), vec!["https://a.example", "https://b.example"]);
    }

    #[test]
    fn seed_urls_keeps_crawl_mode_as_single_seed() {
        let orchestrator = ScrapeOrchestrator::new(config()).unwrap();
        let request = ScrapeRequest {
            job_id: "j1",
            mode: JobMode::Crawl,
            url: "https://a.example/x,y".to_string(),
            page_options: PageOptions::default(),
            progress: None,
        };
        assert_eq!(orchestrator.seed_urls(&request), vec!["https://a.example/x,y"]);
    }

    #[tokio::test]
    async fn run_reports_failure_when_fetch_unreachable() {
        let orchestrator = ScrapeOrchestrator::new(config()).unwrap();
        let outcome = orchestrator
            .run(ScrapeRequest {
                job_id: "j1",
                mode: JobMode::Crawl,
                url: "https://example.invalid".to_string(),
                page_options: PageOptions::default(),
                progress: None,
            })
            .await;
        assert!(!outcome.result.success);
        assert!(outcome.result.docs.is_empty());
    }
}
