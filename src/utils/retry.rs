// Retry with exponential backoff

use std::fmt::Display;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::sleep;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// `None` retries until the operation succeeds
    pub max_retries: Option<u32>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

pub async fn with_retry<F, T, E>(backoff: &Backoff, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> BoxFuture<'static, Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                attempt += 1;
                if backoff.max_retries.is_some_and(|max| attempt >= max) {
                    return Err(error);
                }

                let delay = backoff.delay(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, %error, "Retrying after failure");
                sleep(delay).await;
            }
        }
    }
}
