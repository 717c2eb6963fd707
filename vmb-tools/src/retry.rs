//! Bounded retries for block level operations

use std::future::Future;
use std::time::Duration;

use anyhow::Error;

use vmb_api_types::is_retryable;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

fn backoff(delay: Duration, attempt: usize) -> Duration {
    let factor = 1u32 << (attempt.saturating_sub(1).min(16) as u32);
    delay.saturating_mul(factor).min(MAX_RETRY_DELAY)
}

/// Run `func` until it succeeds, at most `max_retries` times after the first
/// attempt.
///
/// Only transient errors (see [is_retryable]) are retried. The delay doubles
/// with each retry. The last error is returned unchanged.
pub fn retry<T, F>(what: &str, max_retries: usize, delay: Duration, mut func: F) -> Result<T, Error>
where
    F: FnMut() -> Result<T, Error>,
{
    let mut attempt = 0;
    loop {
        match func() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_retries && is_retryable(&err) => {
                attempt += 1;
                log::warn!(
                    "{} failed (attempt {}/{}), retrying - {}",
                    what,
                    attempt,
                    max_retries + 1,
                    err
                );
                std::thread::sleep(backoff(delay, attempt));
            }
            Err(err) => return Err(err),
        }
    }
}

/// Async variant of [retry], sleeping on the tokio timer.
pub async fn retry_async<T, F, R>(
    what: &str,
    max_retries: usize,
    delay: Duration,
    mut func: F,
) -> Result<T, Error>
where
    F: FnMut() -> R,
    R: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        match func().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_retries && is_retryable(&err) => {
                attempt += 1;
                log::warn!(
                    "{} failed (attempt {}/{}), retrying - {}",
                    what,
                    attempt,
                    max_retries + 1,
                    err
                );
                tokio::time::sleep(backoff(delay, attempt)).await;
            }
            Err(err) => return Err(err),
        }
    }
}
