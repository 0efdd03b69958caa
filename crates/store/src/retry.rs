use core::AppError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY_MS: u64 = 100;

/// Retries a fallible Postgres operation up to three times with
/// exponential backoff, surfacing `AppError::StoreUnavailable` once
/// retries are exhausted against a transient error (§4.1 Failure
/// semantics). Non-transient errors (e.g. a uniqueness violation mapped
/// to `Conflict`) are returned immediately without retrying.
pub async fn with_retry<F, Fut, T>(op_name: &str, mut f: F) -> core::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = core::Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                let delay = Duration::from_millis(BASE_DELAY_MS * 2u64.pow(attempt - 1));
                warn!(op_name, attempt, ?delay, error = %e, "state store operation failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_transient() => {
                return Err(AppError::StoreUnavailable(format!(
                    "{op_name} failed after {MAX_ATTEMPTS} attempts: {e}"
                )));
            }
            Err(e) => return Err(e),
        }
    }
}
