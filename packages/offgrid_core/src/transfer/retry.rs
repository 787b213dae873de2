//! Exponential backoff with jitter

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use super::TransferError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_tries: u32,
    pub base: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn upload() -> Self {
        Self {
            max_tries: 5,
            base: Duration::from_millis(400),
            jitter: Duration::from_millis(300),
        }
    }

    pub fn download() -> Self {
        Self {
            max_tries: 5,
            base: Duration::from_millis(300),
            jitter: Duration::from_millis(200),
        }
    }

    /// No waiting between attempts; for tests.
    pub fn immediate(max_tries: u32) -> Self {
        Self {
            max_tries,
            base: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// `base * 2^attempt + U(0, jitter)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.base.saturating_mul(1u32 << attempt.min(16));
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            self.jitter.mul_f64(rand::thread_rng().gen::<f64>())
        };
        backoff + jitter
    }

    /// Run `op` until it succeeds, fails permanently or tries run out.
    /// A busy endpoint is waited on for at least its `Retry-After`.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.max_tries => {
                    let mut delay = self.delay_for(attempt);
                    if let TransferError::Busy { retry_after_secs } = e {
                        delay = delay.max(Duration::from_secs(retry_after_secs));
                    }
                    log::debug!("retry {} after {:?}: {} (try {})", label, delay, e, attempt + 1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
