use serde::{Deserialize, Serialize};
use std::env;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub browser: BrowserConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: u64,
    pub idle_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub redis_url: String,
    pub max_connections: u32,
    pub connection_timeout: u64,
}

/// Which Queue Provider variant to run (§4.2, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueProviderKind {
    Bull,
    CloudTasks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub provider: QueueProviderKind,
    /// Broker connection string (variant A).
    pub broker_url: String,
    pub queue_name: String,
    /// Dispatcher coordinates (variant B).
    pub dispatcher_project: String,
    pub dispatcher_location: String,
    pub dispatcher_queue: String,
    pub dispatcher_service_url: String,
    pub dispatcher_service_account_email: String,
    pub job_ttl_secs: u64,
    pub max_stalled_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub job_lock_extend_interval_ms: u64,
    pub job_lock_extension_time_ms: u64,
    pub cant_accept_connection_interval_ms: u64,
    pub connection_monitor_interval_ms: u64,
    pub got_job_interval_ms: u64,
    pub max_cpu: f64,
    pub max_ram: f64,
    pub max_empty_polls: u32,
    pub empty_poll_base_ms: u64,
    pub empty_poll_cap_ms: u64,
    pub blocked_hosts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    pub url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_gap_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Expose the unlimited variant only behind this flag (§9 open question).
    pub unlimited: bool,
    pub test_suite_tokens: Vec<String>,
    pub manual_team_overrides: Vec<String>,
    pub dev_team_id: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, crate::AppError> {
        let provider = match env_or("QUEUE_PROVIDER", "bull").as_str() {
            "cloud-tasks" => QueueProviderKind::CloudTasks,
            _ => QueueProviderKind::Bull,
        };

        Ok(Self {
            server: ServerConfig {
                host: env_or("SERVER_HOST", "0.0.0.0"),
                port: env_parse_or("SERVER_PORT", 8080u16),
                cors_origins: env_or("CORS_ORIGINS", "http://localhost:3000")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .map_err(|_| crate::AppError::Config("DATABASE_URL is required".to_string()))?,
                max_connections: env_parse_or("DATABASE_MAX_CONNECTIONS", 100),
                min_connections: env_parse_or("DATABASE_MIN_CONNECTIONS", 10),
                connect_timeout: env_parse_or("DATABASE_CONNECT_TIMEOUT", 30),
                idle_timeout: env_parse_or("DATABASE_IDLE_TIMEOUT", 600),
            },
            cache: CacheConfig {
                redis_url: env::var("APP_REDIS_URL")
                    .map_err(|_| crate::AppError::Config("APP_REDIS_URL is required".to_string()))?,
                max_connections: env_parse_or("REDIS_MAX_CONNECTIONS", 100),
                connection_timeout: env_parse_or("REDIS_CONNECTION_TIMEOUT", 5),
            },
            queue: QueueConfig {
                provider,
                broker_url: env_or("BROKER_URL", "redis://localhost:6379"),
                queue_name: env_or("SCRAPE_QUEUE_NAME", "scrapeQueue"),
                dispatcher_project: env_or("DISPATCHER_PROJECT", ""),
                dispatcher_location: env_or("DISPATCHER_LOCATION", ""),
                dispatcher_queue: env_or("DISPATCHER_QUEUE", ""),
                dispatcher_service_url: env_or("DISPATCHER_SERVICE_URL", ""),
                dispatcher_service_account_email: env_or("DISPATCHER_SERVICE_ACCOUNT_EMAIL", ""),
                job_ttl_secs: env_parse_or("QUEUE_JOB_TTL_SECS", 25 * 3600),
                max_stalled_count: env_parse_or("QUEUE_MAX_STALLED_COUNT", 2),
            },
            worker: WorkerConfig {
                job_lock_extend_interval_ms: env_parse_or("JOB_LOCK_EXTEND_INTERVAL", 30_000),
                job_lock_extension_time_ms: env_parse_or("JOB_LOCK_EXTENSION_TIME", 120_000),
                cant_accept_connection_interval_ms: env_parse_or(
                    "CANT_ACCEPT_CONNECTION_INTERVAL",
                    5_000,
                ),
                connection_monitor_interval_ms: env_parse_or("CONNECTION_MONITOR_INTERVAL", 1_000),
                got_job_interval_ms: env_parse_or("GOT_JOB_INTERVAL", 2_000),
                max_cpu: env_parse_or("MAX_CPU", 0.95),
                max_ram: env_parse_or("MAX_RAM", 0.95),
                max_empty_polls: env_parse_or("MAX_EMPTY_POLLS", 10),
                empty_poll_base_ms: env_parse_or("EMPTY_POLL_BASE_MS", 200),
                empty_poll_cap_ms: env_parse_or("EMPTY_POLL_CAP_MS", 30_000),
                blocked_hosts: env_or("BLOCKED_HOSTS", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            browser: BrowserConfig {
                url: env::var("BROWSER_URL")
                    .map_err(|_| crate::AppError::Config("BROWSER_URL is required".to_string()))?,
                timeout_secs: env_parse_or("BROWSER_TIMEOUT_SECS", 30),
                max_retries: env_parse_or("BROWSER_MAX_RETRIES", 3),
                retry_gap_ms: env_parse_or("BROWSER_RETRY_GAP_MS", 1_000),
            },
            rate_limit: RateLimitConfig {
                unlimited: env_parse_or("RATE_LIMIT_UNLIMITED", false),
                test_suite_tokens: env_or("RATE_LIMIT_TEST_SUITE_TOKENS", "test-suite,e2e-test")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                manual_team_overrides: env_or("MANUAL_TEAM_IDS", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                dev_team_id: env::var("DEV_TEAM_ID").ok(),
            },
        })
    }
}
