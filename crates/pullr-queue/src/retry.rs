//! Startup connection retries.

use pullr_core::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Call `connect` until it succeeds, retrying on a fixed `interval`.
///
/// Gives up with `Error::Timeout` once the next attempt would start after
/// `timeout`, and returns `Error::Cancelled` as soon as `cancel` fires, also
/// while an attempt is in progress.
pub async fn connect_with_retry<T, F, Fut>(
    cancel: &CancellationToken,
    interval: Duration,
    timeout: Duration,
    mut connect: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = connect() => result,
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    info!("Connected after {} attempt(s)", attempt);
                }
                return Ok(value);
            }
            Err(e) => {
                if Instant::now() + interval > deadline {
                    return Err(Error::Timeout(format!(
                        "gave up connecting after {} attempt(s): {}",
                        attempt, e
                    )));
                }

                warn!(attempt, error = %e, "Connection failed, retrying in {:?}", interval);

                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
    }
}
