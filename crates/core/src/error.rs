use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// The error kinds shared across the state store, queue, crawl and worker
/// crates. Every failure mode named in the orchestration contract maps to
/// exactly one variant here so propagation policy can be expressed as a
/// single `match` instead of being re-derived at each crate boundary.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("illegal status transition: {0}")]
    IllegalTransition(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store unstable after repeated timeouts: {0}")]
    StoreUnstable(String),

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("execution failed: {0}")]
    ExecutionFailure(String),

    #[error("url blocked: {0}")]
    Blocked(String),

    #[error("rate limited")]
    RateLimited,

    #[error("timed out waiting for job")]
    Timeout,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal server error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::Config(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::IllegalTransition(_) => StatusCode::CONFLICT,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Timeout => StatusCode::REQUEST_TIMEOUT,
            AppError::Blocked(_) => StatusCode::OK,
            AppError::StoreUnavailable(_)
            | AppError::StoreUnstable(_)
            | AppError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::IllegalTransition(_) => "illegal_transition",
            AppError::StoreUnavailable(_) => "store_unavailable",
            AppError::StoreUnstable(_) => "store_unstable",
            AppError::QueueUnavailable(_) => "queue_unavailable",
            AppError::ExecutionFailure(_) => "execution_failure",
            AppError::Blocked(_) => "blocked",
            AppError::RateLimited => "rate_limited",
            AppError::Timeout => "timeout",
            AppError::Config(_) => "config_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::Database(_) => "database_error",
            AppError::Redis(_) => "redis_error",
            AppError::Http(_) => "http_error",
            AppError::Json(_) => "json_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// True for errors a caller should retry after local backoff rather
    /// than surface immediately (transient store/queue failures).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::Redis(_) | AppError::StoreUnavailable(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = Uuid::new_v4();

        let body = Json(json!({
            "error": self.error_code(),
            "message": self.to_string(),
            "request_id": request_id,
        }));

        (status, body).into_response()
    }
}
