use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::time::TimestampProvider;

use super::engine::StoreError;

const BASE_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Runs `op`, retrying temporary failures with doubling back-off until
/// `max_time` has elapsed. Permanent failures are returned immediately.
pub async fn execute_with_retries<T, F, Fut>(
    what: &str,
    max_time: Duration,
    times: &dyn TimestampProvider,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let deadline = times.now().saturating_add(times.ticks(max_time));
    let mut backoff = BASE_BACKOFF;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err @ StoreError::Permanent(_)) => return Err(err),
            Err(err) => {
                if times.now() >= deadline {
                    warn!(operation = what, error = %err, "giving up after exhausting read time budget");
                    return Err(err);
                }
                warn!(operation = what, error = %err, ?backoff, "temporary failure, retrying");
                times.sleep_for(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}
