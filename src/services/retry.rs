use std::future::Future;
use std::time::Duration;

/// Exponential backoff: attempt `n` (1-based) waits `base * 2^(n-1)` before
/// the next attempt.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub attempts: u32,
    pub base: Duration,
}

impl Backoff {
    pub fn new(attempts: u32, base: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1 << exponent)
    }
}

/// Run `op` until it succeeds or the attempts are used up, sleeping between
/// attempts. Returns the last error.
pub async fn retry_with_backoff<T, E, F, Fut>(backoff: Backoff, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= backoff.attempts => return Err(e),
            Err(e) => {
                let delay = backoff.delay(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = backoff.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
