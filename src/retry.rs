//! Bounded retry with exponential backoff for collaborator calls

use crate::Result;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Run `operation` up to `max_attempts` times, sleeping
/// `base_delay * 2^attempt` between failures. Only the final error is
/// returned; intermediate failures are logged.
pub async fn retry_with_backoff<T, F, Fut>(
    max_attempts: u32,
    base_delay: Duration,
    op_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..max_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt + 1 < max_attempts {
                    let delay = base_delay * 2u32.pow(attempt);
                    warn!(
                        op = op_name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    error!(op = op_name, attempts = max_attempts, error = %e, "All attempts failed");
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.expect("at least one attempt"))
}
