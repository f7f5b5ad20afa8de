// Retry with exponential backoff for transient API failures

use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

pub async fn with_retry<F, Fut, T, E>(mut operation: F, max_retries: u32) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                attempt += 1;
                if attempt >= max_retries {
                    return Err(error);
                }

                let delay = Duration::from_secs(2u64.pow(attempt.min(5)));
                warn!(attempt, delay_secs = delay.as_secs(), error = %error, "Retrying after failure");
                sleep(delay).await;
            }
        }
    }
}
