use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub mod redis_cache;

pub use redis_cache::RedisCache;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    
    #[error("Connection pool error: {0}")]
    Pool(String),
    
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    
    #[error("Key not found: {0}")]
    NotFound(String),
    
    #[error("Cache operation timeout")]
    Timeout,
}

/// Trait defining cache operations for the crawl orchestrator
#[async_trait]
pub trait CacheLayer: Send + Sync + Clone {
    /// Get a value from cache by key
    async fn get<T>(&self, key: &str) -> Result<Option<T>, CacheError>
    where
        T: serde::de::DeserializeOwned + Send;

    /// Set a value in cache with optional TTL
    async fn set<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<(), CacheError>
    where
        T: serde::Serialize + Send + Sync;

    /// Delete a key from cache
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Check if a key exists in cache
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Invalidate multiple keys matching a pattern
    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, CacheError>;

    /// Get multiple keys at once
    async fn mget<T>(&self, keys: &[String]) -> Result<Vec<Option<T>>, CacheError>
    where
        T: serde::de::DeserializeOwned + Send;

    /// Set multiple key-value pairs at once
    async fn mset<T>(&self, items: &[(String, T)], ttl: Option<Duration>) -> Result<(), CacheError>
    where
        T: serde::Serialize + Send + Sync;

    /// Increment a numeric value (for counters, rate limiting)
    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, CacheError>;
}

/// Cache key utilities for consistent naming across the rate limiter,
/// crawl coordinator and priority engine.
pub struct CacheKeys;

impl CacheKeys {
    /// Fixed-window rate limit counter, keyed by mode/plan/tenant so that
    /// distinct request shapes never share a bucket.
    pub fn rate_limit(mode: &str, plan: &str, tenant_id: &str, window_secs: i64) -> String {
        let window = chrono::Utc::now().timestamp() / window_secs;
        format!("rate_limit:{}:{}:{}:{}", mode, plan, tenant_id, window)
    }

    /// Per-tenant active job counter read by the priority engine.
    pub fn team_job_count(team_id: &str) -> String {
        format!("team:{}:job_count", team_id)
    }

    /// Individual team-job bookkeeping record set, so a worker can remove
    /// its own entry without scanning the counter key.
    pub fn team_job_member(team_id: &str, job_id: &str) -> String {
        format!("team:{}:jobs:{}", team_id, job_id)
    }

    /// At-most-once URL lock within a single crawl.
    pub fn url_lock(crawl_id: &str, url_hash: &str) -> String {
        format!("crawl:{}:lock:{}", crawl_id, url_hash)
    }

    /// Cached robots.txt body for a crawl's origin host.
    pub fn robots_txt(host: &str) -> String {
        format!("robots:{}", host)
    }
}

/// Cache configuration structure for Redis connection
#[derive(Debug, Clone)]
pub struct RedisCacheConfig {
    pub redis_url: String,
    pub max_connections: u32,
    pub connection_timeout: u64,
    pub default_ttl: Duration,
    pub session_ttl: Duration,
    pub found_data_ttl: Duration,
    pub not_found_ttl: Duration,
}

impl RedisCacheConfig {
    pub fn from_env() -> Result<Self, std::env::VarError> {
        Ok(Self {
            redis_url: std::env::var("APP_REDIS_URL")?,
            max_connections: std::env::var("REDIS_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .unwrap_or(100),
            connection_timeout: std::env::var("REDIS_CONNECTION_TIMEOUT")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),
            default_ttl: Duration::from_secs(3600), // 1 hour default
            session_ttl: Duration::from_secs(
                std::env::var("CACHE_TTL_SESSION")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()
                    .unwrap_or(3600)
            ),
            found_data_ttl: Duration::from_secs(
                std::env::var("CACHE_TTL_FOUND")
                    .unwrap_or_else(|_| "86400".to_string())
                    .parse()
                    .unwrap_or(86400)
            ),
            not_found_ttl: Duration::from_secs(
                std::env::var("CACHE_TTL_NOT_FOUND")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()
                    .unwrap_or(3600)
            ),
        })
    }
}