use crate::cache::{CacheError, CacheKeys, CacheLayer};
use crate::config::RateLimitConfig;
use crate::error::AppError;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

const WINDOW_SECS: i64 = 60;
const TEST_SUITE_POINTS: i64 = 1_000_000;
const DEV_TEAM_POINTS: i64 = 1_200;
const MANUAL_TEAM_POINTS: i64 = 2_000;

/// Rate limiter modes, matched against the `mode` argument of
/// `getRateLimiter` (§4.3). Kept as an open string on the wire so new
/// modes don't require a core release, but the table below is keyed by
/// this fixed set for the ones the rewrite actually enforces.
pub const MODES: &[&str] = &[
    "crawl",
    "scrape",
    "search",
    "map",
    "preview",
    "account",
    "crawl_status",
    "test_suite",
];

/// A per-(mode, plan) row of the rate limit table, keyed by
/// hyphen-stripped, lowercased plan name with a mandatory `default`.
#[derive(Debug, Clone)]
pub struct RateLimitTable {
    rows: HashMap<&'static str, HashMap<&'static str, i64>>,
}

impl Default for RateLimitTable {
    /// Representative defaults from the source system; operators override
    /// individual cells via `RateLimitTable::with_override`.
    fn default() -> Self {
        let mut rows = HashMap::new();
        rows.insert(
            "crawl",
            HashMap::from([
                ("free", 2),
                ("starter", 10),
                ("standard", 5),
                ("scale", 50),
                ("growth", 50),
                ("default", 3),
            ]),
        );
        rows.insert(
            "scrape",
            HashMap::from([
                ("free", 10),
                ("starter", 100),
                ("standard", 100),
                ("scale", 500),
                ("growth", 1000),
                ("default", 20),
            ]),
        );
        rows.insert(
            "search",
            HashMap::from([
                ("free", 5),
                ("starter", 50),
                ("standard", 50),
                ("scale", 500),
                ("growth", 500),
                ("default", 20),
            ]),
        );
        rows.insert("map", HashMap::from([("default", 50)]));
        rows.insert("preview", HashMap::from([("default", 50)]));
        rows.insert("account", HashMap::from([("default", 100)]));
        rows.insert("crawl_status", HashMap::from([("default", 500)]));
        rows.insert("test_suite", HashMap::from([("default", TEST_SUITE_POINTS)]));
        Self { rows }
    }
}

impl RateLimitTable {
    fn points_for(&self, mode: &str, plan_key: &str) -> i64 {
        let Some(row) = self.rows.get(mode) else {
            return 20;
        };
        row.get(plan_key).or_else(|| row.get("default")).copied().unwrap_or(20)
    }
}

/// A fixed-window token bucket resolved for one (mode, plan, tenant)
/// combination (§4.3, §GLOSSARY "Bucket").
#[derive(Debug, Clone)]
pub struct Bucket {
    pub key: String,
    pub points: i64,
}

/// Multi-tier rate limiter keyed by (mode, plan, tenant), backed by any
/// `CacheLayer` implementation's atomic counter.
#[derive(Clone)]
pub struct RateLimiter<C: CacheLayer> {
    cache: C,
    config: RateLimitConfig,
    table: RateLimitTable,
}

impl<C: CacheLayer> RateLimiter<C> {
    pub fn new(cache: C, config: RateLimitConfig) -> Self {
        Self {
            cache,
            config,
            table: RateLimitTable::default(),
        }
    }

    pub fn with_table(mut self, table: RateLimitTable) -> Self {
        self.table = table;
        self
    }

    /// Resolves the bucket for a request, applying the three overrides
    /// before falling back to table lookup (§4.3).
    pub fn resolve_bucket(&self, mode: &str, token: &str, plan: Option<&str>, team_id: Option<&str>) -> Bucket {
        if self.config.test_suite_tokens.iter().any(|t| token.contains(t.as_str())) {
            return Bucket {
                key: CacheKeys::rate_limit(mode, "test-suite", token, WINDOW_SECS),
                points: TEST_SUITE_POINTS,
            };
        }

        if let Some(dev_team) = self.config.dev_team_id.as_deref() {
            if team_id == Some(dev_team) {
                return Bucket {
                    key: CacheKeys::rate_limit(mode, "dev", dev_team, WINDOW_SECS),
                    points: DEV_TEAM_POINTS,
                };
            }
        }

        if let Some(team_id) = team_id {
            if self.config.manual_team_overrides.iter().any(|t| t == team_id) {
                return Bucket {
                    key: CacheKeys::rate_limit(mode, "manual", team_id, WINDOW_SECS),
                    points: MANUAL_TEAM_POINTS,
                };
            }
        }

        let plan_key = plan.unwrap_or("default").replace('-', "").to_lowercase();
        let tenant = team_id.unwrap_or("anonymous");
        Bucket {
            key: CacheKeys::rate_limit(mode, &plan_key, tenant, WINDOW_SECS),
            points: self.table.points_for(mode, &plan_key),
        }
    }

    /// Consumes `points` from the bucket, returning `Err(AppError::RateLimited)`
    /// once the window's limit is exceeded. Fails open on transient store
    /// errors (§4.3 Failure semantics) unless the unlimited escape hatch is
    /// set, in which case every check is skipped entirely.
    pub async fn consume(
        &self,
        mode: &str,
        token: &str,
        plan: Option<&str>,
        team_id: Option<&str>,
        points: i64,
    ) -> Result<(), AppError> {
        if self.config.unlimited {
            return Ok(());
        }

        let bucket = self.resolve_bucket(mode, token, plan, team_id);
        match self
            .cache
            .incr(&bucket.key, points, Some(Duration::from_secs(WINDOW_SECS as u64)))
            .await
        {
            Ok(count) if count > bucket.points => Err(AppError::RateLimited),
            Ok(_) => Ok(()),
            Err(CacheError::Pool(_)) | Err(CacheError::Redis(_)) | Err(CacheError::Timeout) => {
                warn!(mode, token_bucket = %bucket.key, "rate limiter store unavailable, allowing request");
                Ok(())
            }
            Err(e) => Err(AppError::Internal(e.to_string())),
        }
    }

    /// Adds extra points to a tenant's bucket for the remainder of the
    /// current window, tightening its effective limit (abuse response).
    pub async fn penalty(
        &self,
        mode: &str,
        token: &str,
        plan: Option<&str>,
        team_id: Option<&str>,
        points: i64,
    ) -> Result<(), AppError> {
        let bucket = self.resolve_bucket(mode, token, plan, team_id);
        self.cache
            .incr(&bucket.key, points, Some(Duration::from_secs(WINDOW_SECS as u64)))
            .await
            .map(|_| ())
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    /// Refunds points to a tenant's bucket, loosening its effective limit
    /// for the remainder of the current window (good-behavior response).
    /// The counter is never driven below zero.
    pub async fn reward(
        &self,
        mode: &str,
        token: &str,
        plan: Option<&str>,
        team_id: Option<&str>,
        points: i64,
    ) -> Result<(), AppError> {
        let bucket = self.resolve_bucket(mode, token, plan, team_id);
        match self.cache.incr(&bucket.key, -points, None).await {
            Ok(count) if count < 0 => self
                .cache
                .incr(&bucket.key, -count, None)
                .await
                .map(|_| ())
                .map_err(|e| AppError::Internal(e.to_string())),
            Ok(_) => Ok(()),
            Err(e) => Err(AppError::Internal(e.to_string())),
        }
    }

    /// Temporarily denies every request against a bucket for `seconds`,
    /// independent of its counter (manual abuse response).
    pub async fn block(&self, bucket_key: &str, seconds: u64) -> Result<(), AppError> {
        self.cache
            .set(&format!("{bucket_key}:blocked"), &true, Some(Duration::from_secs(seconds)))
            .await
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    pub async fn is_blocked(&self, bucket_key: &str) -> Result<bool, AppError> {
        self.cache
            .get::<bool>(&format!("{bucket_key}:blocked"))
            .await
            .map(|v| v.unwrap_or(false))
            .or(Ok(false))
    }
}
