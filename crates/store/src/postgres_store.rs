use crate::retry::with_retry;
use crate::truncate::fit_result_to_budget;
use crate::StateStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use core::{AppError, Crawl, DatabaseConfig, Job, JobMode, JobOptions, JobPayload, JobStatus, PageOptions, SYSTEM_TEAM_ID};
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::time::Duration;
use tracing::{error, info};

pub async fn create_pool(config: &DatabaseConfig) -> core::Result<PgPool> {
    info!("connecting to state store database");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout))
        .idle_timeout(Duration::from_secs(config.idle_timeout))
        .test_before_acquire(true)
        .connect(&config.url)
        .await
        .map_err(|e| {
            error!("failed to connect to state store database: {e}");
            AppError::Database(e)
        })?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| AppError::Internal(format!("migration failed: {e}")))?;

    info!("state store database connection pool ready");
    Ok(pool)
}

#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn job_from_row(row: &sqlx::postgres::PgRow) -> core::Result<Job> {
        let doc: Value = row.try_get("doc")?;
        serde_json::from_value(doc).map_err(AppError::Json)
    }

    fn crawl_from_row(row: &sqlx::postgres::PgRow) -> core::Result<Crawl> {
        let doc: Value = row.try_get("doc")?;
        serde_json::from_value(doc).map_err(AppError::Json)
    }

    /// Minimal placeholder written when a completion/failure arrives for
    /// a job whose creation record was lost (§4.1 `markJobCompleted`).
    fn placeholder_job(job_id: &str) -> Job {
        Job::new(
            job_id.to_string(),
            "unknown".to_string(),
            JobPayload {
                url: String::new(),
                mode: JobMode::SingleUrls,
                team_id: SYSTEM_TEAM_ID.to_string(),
                page_options: PageOptions::default(),
                crawl_id: None,
                webhook: None,
                is_crawl_source_url: false,
                cloud_tasks_id: None,
            },
            JobOptions {
                job_id: job_id.to_string(),
                priority: 10,
                attempts: 1,
                backoff: Default::default(),
            },
        )
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn create_job(&self, job: &Job) -> core::Result<()> {
        with_retry("create_job", || async {
            let doc = serde_json::to_value(job).map_err(AppError::Json)?;
            let result = sqlx::query(
                r#"
                INSERT INTO jobs (id, name, team_id, crawl_id, status, doc, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(&job.id)
            .bind(&job.name)
            .bind(&job.data.team_id)
            .bind(&job.data.crawl_id)
            .bind(status_str(job.status))
            .bind(&doc)
            .bind(job.created_at)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;

            if result.rows_affected() == 0 {
                return Err(AppError::Conflict(format!("job {} already exists", job.id)));
            }
            Ok(())
        })
        .await
    }

    async fn mark_job_started(&self, job_id: &str) -> core::Result<()> {
        with_retry("mark_job_started", || async {
            let row = sqlx::query(r#"SELECT status, doc FROM jobs WHERE id = $1 FOR UPDATE"#)
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(AppError::Database)?;

            let Some(row) = row else {
                return Err(AppError::NotFound(format!("job {job_id} not found")));
            };

            let current: JobStatus = parse_status(row.try_get("status")?)?;
            if !current.can_transition_to(JobStatus::Active) {
                return Err(AppError::IllegalTransition(format!(
                    "job {job_id} cannot move from {current:?} to active"
                )));
            }

            let mut doc: Value = row.try_get("doc")?;
            doc["status"] = json!("active");
            doc["updated_at"] = json!(Utc::now());

            sqlx::query(r#"UPDATE jobs SET status = 'active', doc = $2, updated_at = now() WHERE id = $1"#)
                .bind(job_id)
                .bind(&doc)
                .execute(&self.pool)
                .await
                .map_err(AppError::Database)?;
            Ok(())
        })
        .await
    }

    async fn mark_job_completed(&self, job_id: &str, result: Value) -> core::Result<()> {
        self.complete_or_fail(job_id, Outcome::Completed(result)).await
    }

    async fn mark_job_failed(&self, job_id: &str, error: &str) -> core::Result<()> {
        self.complete_or_fail(job_id, Outcome::Failed(error.to_string())).await
    }

    async fn update_job_progress(&self, job_id: &str, progress: Value) -> core::Result<()> {
        with_retry("update_job_progress", || async {
            sqlx::query(
                r#"
                UPDATE jobs
                SET doc = jsonb_set(jsonb_set(doc, '{progress}', $2), '{updated_at}', to_jsonb(now())),
                    updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(&progress)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
            Ok(())
        })
        .await
    }

    async fn get_job_state(&self, job_id: &str) -> core::Result<Option<JobStatus>> {
        with_retry("get_job_state", || async {
            let row = sqlx::query(r#"SELECT status FROM jobs WHERE id = $1"#)
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(AppError::Database)?;
            match row {
                Some(r) => Ok(Some(parse_status(r.try_get("status")?)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn get_job_result(&self, job_id: &str) -> core::Result<Option<Value>> {
        with_retry("get_job_result", || async {
            let row = sqlx::query(r#"SELECT doc -> 'result' AS result FROM jobs WHERE id = $1"#)
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(AppError::Database)?;
            Ok(row.and_then(|r| r.try_get::<Option<Value>, _>("result").ok().flatten()))
        })
        .await
    }

    async fn get_job_error(&self, job_id: &str) -> core::Result<Option<String>> {
        with_retry("get_job_error", || async {
            let row = sqlx::query(r#"SELECT doc ->> 'error' AS error FROM jobs WHERE id = $1"#)
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(AppError::Database)?;
            Ok(row.and_then(|r| r.try_get::<Option<String>, _>("error").ok().flatten()))
        })
        .await
    }

    async fn get_job_data(&self, job_id: &str) -> core::Result<Option<Job>> {
        with_retry("get_job_data", || async {
            let row = sqlx::query(r#"SELECT doc FROM jobs WHERE id = $1"#)
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(AppError::Database)?;
            match row {
                Some(r) => Ok(Some(Self::job_from_row(&r)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn remove_job(&self, job_id: &str) -> core::Result<()> {
        with_retry("remove_job", || async {
            sqlx::query(r#"DELETE FROM jobs WHERE id = $1"#)
                .bind(job_id)
                .execute(&self.pool)
                .await
                .map_err(AppError::Database)?;
            Ok(())
        })
        .await
    }

    async fn save_crawl(&self, crawl: &Crawl) -> core::Result<()> {
        with_retry("save_crawl", || async {
            let doc = serde_json::to_value(crawl).map_err(AppError::Json)?;
            sqlx::query(
                r#"
                INSERT INTO crawls (id, team_id, status, cancelled, total_urls, completed_urls, failed_urls, doc, created_at, expires_at)
                VALUES ($1, $2, 'created', false, 0, 0, 0, $3, $4, $5)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(&crawl.id)
            .bind(&crawl.team_id)
            .bind(&doc)
            .bind(crawl.created_at)
            .bind(crawl.expires_at)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
            Ok(())
        })
        .await
    }

    async fn get_crawl(&self, crawl_id: &str) -> core::Result<Option<Crawl>> {
        with_retry("get_crawl", || async {
            let row = sqlx::query(r#"SELECT doc FROM crawls WHERE id = $1"#)
                .bind(crawl_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(AppError::Database)?;
            match row {
                Some(r) => Ok(Some(Self::crawl_from_row(&r)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn get_crawl_expiry(&self, crawl_id: &str) -> core::Result<Option<DateTime<Utc>>> {
        with_retry("get_crawl_expiry", || async {
            let row = sqlx::query(r#"SELECT expires_at FROM crawls WHERE id = $1"#)
                .bind(crawl_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(AppError::Database)?;
            match row {
                Some(r) => Ok(Some(r.try_get("expires_at")?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn add_crawl_job(&self, crawl_id: &str, job_id: &str) -> core::Result<()> {
        self.add_crawl_jobs(crawl_id, std::slice::from_ref(&job_id.to_string())).await
    }

    async fn add_crawl_jobs(&self, crawl_id: &str, job_ids: &[String]) -> core::Result<()> {
        if job_ids.is_empty() {
            return Ok(());
        }
        with_retry("add_crawl_jobs", || async {
            let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

            let mut inserted = 0u64;
            for job_id in job_ids {
                let result = sqlx::query(
                    r#"INSERT INTO crawl_jobs (crawl_id, job_id) VALUES ($1, $2) ON CONFLICT DO NOTHING"#,
                )
                .bind(crawl_id)
                .bind(job_id)
                .execute(&mut *tx)
                .await
                .map_err(AppError::Database)?;
                inserted += result.rows_affected();
            }

            if inserted > 0 {
                let ids_json: Value = Value::Array(job_ids.iter().map(|id| json!(id)).collect());
                sqlx::query(
                    r#"
                    UPDATE crawls
                    SET total_urls = total_urls + $2,
                        status = CASE WHEN status = 'created' THEN 'scraping' ELSE status END,
                        doc = jsonb_set(
                            jsonb_set(
                                jsonb_set(doc, '{urls}', (COALESCE(doc -> 'urls', '[]'::jsonb)) || $3),
                                '{status}',
                                CASE WHEN doc ->> 'status' = 'created' THEN '"scraping"'::jsonb ELSE doc -> 'status' END
                            ),
                            '{total_urls}',
                            to_jsonb(total_urls + $2)
                        )
                    WHERE id = $1
                    "#,
                )
                .bind(crawl_id)
                .bind(inserted as i64)
                .bind(&ids_json)
                .execute(&mut *tx)
                .await
                .map_err(AppError::Database)?;
            }

            tx.commit().await.map_err(AppError::Database)?;
            Ok(())
        })
        .await
    }

    async fn add_crawl_job_done(&self, crawl_id: &str, job_id: &str, success: bool) -> core::Result<()> {
        with_retry("add_crawl_job_done", || async {
            let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

            let result = sqlx::query(
                r#"
                UPDATE crawl_jobs
                SET done = true, done_seq = nextval('crawl_jobs_done_seq')
                WHERE crawl_id = $1 AND job_id = $2 AND done = false
                "#,
            )
            .bind(crawl_id)
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;

            if result.rows_affected() == 0 {
                // Already recorded done — idempotent no-op (§3 at-least-once delivery).
                tx.commit().await.map_err(AppError::Database)?;
                return Ok(());
            }

            let counter_col = if success { "completed_urls" } else { "failed_urls" };
            let list_field = if success { "completed_jobs" } else { "failed_jobs" };

            let row = sqlx::query(&format!(
                r#"
                UPDATE crawls
                SET {counter_col} = {counter_col} + 1,
                    doc = jsonb_set(
                        jsonb_set(doc, '{{{list_field}}}', (COALESCE(doc -> '{list_field}', '[]'::jsonb)) || to_jsonb($2::text)),
                        '{{{counter_col}}}',
                        to_jsonb({counter_col} + 1)
                    )
                WHERE id = $1
                RETURNING total_urls, completed_urls, failed_urls
                "#
            ))
            .bind(crawl_id)
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(AppError::Database)?;

            let total: i64 = row.try_get("total_urls")?;
            let completed: i64 = row.try_get("completed_urls")?;
            let failed: i64 = row.try_get("failed_urls")?;

            if total > 0 && completed + failed >= total {
                sqlx::query(
                    r#"
                    UPDATE crawls
                    SET status = 'completed',
                        doc = jsonb_set(jsonb_set(doc, '{status}', '"completed"'), '{endTime}', to_jsonb(now()))
                    WHERE id = $1 AND status <> 'completed'
                    "#,
                )
                .bind(crawl_id)
                .execute(&mut *tx)
                .await
                .map_err(AppError::Database)?;
            }

            tx.commit().await.map_err(AppError::Database)?;
            Ok(())
        })
        .await
    }

    async fn get_done_jobs_ordered_length(&self, crawl_id: &str) -> core::Result<u64> {
        with_retry("get_done_jobs_ordered_length", || async {
            let row = sqlx::query(r#"SELECT count(*) AS n FROM crawl_jobs WHERE crawl_id = $1 AND done = true"#)
                .bind(crawl_id)
                .fetch_one(&self.pool)
                .await
                .map_err(AppError::Database)?;
            let n: i64 = row.try_get("n")?;
            Ok(n as u64)
        })
        .await
    }

    async fn get_done_jobs_ordered(&self, crawl_id: &str, start: i64, end: Option<i64>) -> core::Result<Vec<String>> {
        with_retry("get_done_jobs_ordered", || async {
            let limit = end.map(|e| (e - start).max(0));
            let rows = sqlx::query(
                r#"
                SELECT job_id FROM crawl_jobs
                WHERE crawl_id = $1 AND done = true
                ORDER BY done_seq ASC
                OFFSET $2
                LIMIT $3
                "#,
            )
            .bind(crawl_id)
            .bind(start)
            .bind(limit) // None binds as SQL NULL -> LIMIT NULL -> no limit
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::Database)?;

            rows.iter().map(|r| r.try_get::<String, _>("job_id").map_err(AppError::Database)).collect()
        })
        .await
    }

    async fn is_crawl_finished(&self, crawl_id: &str) -> core::Result<bool> {
        let crawl = self.get_crawl(crawl_id).await?;
        Ok(crawl.map(|c| c.is_finished()).unwrap_or(false))
    }

    async fn finish_crawl(&self, crawl_id: &str) -> core::Result<()> {
        with_retry("finish_crawl", || async {
            sqlx::query(
                r#"
                UPDATE crawls
                SET status = 'completed',
                    doc = jsonb_set(jsonb_set(doc, '{status}', '"completed"'), '{endTime}', to_jsonb(now()))
                WHERE id = $1 AND status <> 'completed'
                "#,
            )
            .bind(crawl_id)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
            Ok(())
        })
        .await
    }

    async fn lock_url(&self, url: &str, crawl_id: &str) -> core::Result<bool> {
        with_retry("lock_url", || async {
            let hash = core::url_hash::hash_url(url);
            let expires_at = Utc::now() + ChronoDuration::hours(24);

            let result = sqlx::query(
                r#"
                INSERT INTO url_locks (url_hash, url, crawl_id, created_at, expires_at)
                VALUES ($1, $2, $3, now(), $4)
                ON CONFLICT (url_hash) DO UPDATE
                    SET url = EXCLUDED.url, crawl_id = EXCLUDED.crawl_id, created_at = now(), expires_at = EXCLUDED.expires_at
                    WHERE url_locks.expires_at < now()
                "#,
            )
            .bind(&hash)
            .bind(url)
            .bind(crawl_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;

            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn lock_urls(&self, crawl_id: &str, urls: &[String]) -> core::Result<bool> {
        let mut all_ok = true;
        for url in urls {
            if !self.lock_url(url, crawl_id).await? {
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    async fn add_team_job(&self, team_id: &str, job_id: &str) -> core::Result<()> {
        with_retry("add_team_job", || async {
            let expires_at = Utc::now() + ChronoDuration::minutes(10);
            sqlx::query(
                r#"
                INSERT INTO team_jobs (team_id, job_id, created_at, expires_at)
                VALUES ($1, $2, now(), $3)
                ON CONFLICT (team_id, job_id) DO UPDATE SET created_at = now(), expires_at = EXCLUDED.expires_at
                "#,
            )
            .bind(team_id)
            .bind(job_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
            Ok(())
        })
        .await
    }

    async fn remove_team_job(&self, team_id: &str, job_id: &str) -> core::Result<()> {
        with_retry("remove_team_job", || async {
            sqlx::query(r#"DELETE FROM team_jobs WHERE team_id = $1 AND job_id = $2"#)
                .bind(team_id)
                .bind(job_id)
                .execute(&self.pool)
                .await
                .map_err(AppError::Database)?;
            Ok(())
        })
        .await
    }

    async fn get_team_job_count(&self, team_id: &str) -> core::Result<u64> {
        with_retry("get_team_job_count", || async {
            let row = sqlx::query(r#"SELECT count(*) AS n FROM team_jobs WHERE team_id = $1 AND expires_at > now()"#)
                .bind(team_id)
                .fetch_one(&self.pool)
                .await
                .map_err(AppError::Database)?;
            let n: i64 = row.try_get("n")?;
            Ok(n as u64)
        })
        .await
    }
}

enum Outcome {
    Completed(Value),
    Failed(String),
}

impl PostgresStateStore {
    async fn complete_or_fail(&self, job_id: &str, outcome: Outcome) -> core::Result<()> {
        with_retry("complete_or_fail", || async {
            let row = sqlx::query(r#"SELECT doc FROM jobs WHERE id = $1"#)
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(AppError::Database)?;

            let mut job = match row {
                Some(r) => Self::job_from_row(&r)?,
                None => Self::placeholder_job(job_id),
            };

            if job.status.is_terminal() {
                // Second delivery of an already-completed/failed job (§4.2 at-least-once
                // redelivery) — the State Store read gates the terminal transition.
                return Ok(());
            }

            let (status, crawl_id, success) = match &outcome {
                Outcome::Completed(result) => {
                    job.status = JobStatus::Completed;
                    job.progress = json!(100);
                    job.result = Some(fit_result_to_budget(result.clone()));
                    job.error = None;
                    ("completed", job.data.crawl_id.clone(), true)
                }
                Outcome::Failed(message) => {
                    job.status = JobStatus::Failed;
                    job.error = Some(message.clone());
                    ("failed", job.data.crawl_id.clone(), false)
                }
            };
            job.updated_at = Utc::now();

            let doc = serde_json::to_value(&job).map_err(AppError::Json)?;
            sqlx::query(
                r#"
                INSERT INTO jobs (id, name, team_id, crawl_id, status, doc, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
                ON CONFLICT (id) DO UPDATE
                    SET status = EXCLUDED.status, doc = EXCLUDED.doc, updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&job.id)
            .bind(&job.name)
            .bind(&job.data.team_id)
            .bind(&job.data.crawl_id)
            .bind(status)
            .bind(&doc)
            .bind(job.updated_at)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;

            if let Some(crawl_id) = crawl_id {
                self.add_crawl_job_done(&crawl_id, job_id, success).await?;
            }
            Ok(())
        })
        .await
    }
}

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Waiting => "waiting",
        JobStatus::Active => "active",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
    }
}

fn parse_status(s: String) -> core::Result<JobStatus> {
    match s.as_str() {
        "waiting" => Ok(JobStatus::Waiting),
        "active" => Ok(JobStatus::Active),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        other => Err(AppError::Internal(format!("unknown job status in store: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_its_string_form() {
        for status in [JobStatus::Waiting, JobStatus::Active, JobStatus::Completed, JobStatus::Failed] {
            assert_eq!(parse_status(status_str(status).to_string()).unwrap(), status);
        }
    }

    #[test]
    fn parse_status_rejects_unknown_strings() {
        assert!(parse_status("retrying".to_string()).is_err());
    }
}
