//! The retry wrapper: up to `max_retries` additional attempts with a
//! fixed delay between them, counting retries for the caller's metrics.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;

/// A successful value plus how many retries it took to get it.
#[derive(Debug, Clone, Copy)]
pub struct Attempted<T> {
    pub value: T,
    pub retries: u32,
}

/// Retry `attempt` up to `max_retries` additional times, sleeping `delay`
/// between failures. Returns the last error if every attempt fails.
///
/// `on_retry` fires after each failed attempt, before the sleep, so a
/// caller can publish an `IN_PROGRESS` step with the current retry count —
/// pass an async no-op closure when that isn't needed.
pub async fn with_retry<F, Fut, T, H, HFut>(
    max_retries: u32,
    delay: Duration,
    mut attempt: F,
    mut on_retry: H,
) -> Result<Attempted<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    H: FnMut(u32, &anyhow::Error) -> HFut,
    HFut: Future<Output = ()>,
{
    let mut retries = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(Attempted { value, retries }),
            Err(err) => {
                if retries >= max_retries {
                    return Err(err);
                }
                retries += 1;
                tracing::warn!(retries, max_retries, error = %err, "attempt failed, retrying");
                on_retry(retries, &err).await;
                tokio::time::sleep(delay).await;
            }
        }
    }
}
