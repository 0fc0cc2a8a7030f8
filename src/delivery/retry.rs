use super::backoff::BackoffPolicy;
use super::{AttemptError, DeliveryError};
use std::future::Future;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs `attempt` until it succeeds or the attempt budget is spent, sleeping the backoff
    /// delay between attempts. The sleep is abandoned as soon as `cancel` fires.
    pub async fn run<F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<(), DeliveryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), AttemptError>>,
    {
        let mut number = 1;
        loop {
            let err = match attempt(number).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            tracing::warn!(
                attempt = number,
                max_attempts = self.max_attempts,
                error = %err,
                "delivery attempt failed"
            );

            if number >= self.max_attempts {
                return Err(DeliveryError::Exhausted {
                    attempts: number,
                    last: err,
                });
            }

            let delay = self.backoff.delay(number);
            tokio::select! {
                _ = cancel.cancelled() => return Err(DeliveryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            number += 1;
        }
    }
}
