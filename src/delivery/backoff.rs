use rand::Rng;
use std::time::Duration;

/// Doubling delay between delivery attempts, capped at `max_delay`.
///
/// `attempt` is the number of the attempt that just failed (starting at 1), so the first wait is
/// `initial_delay`, the second `2 * initial_delay`, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
        }
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1);
        let factor = 2u32.saturating_pow(doublings);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Exponential delay scaled by a random factor in `[1 - jitter, 1 + jitter]`, never above the
/// exponential cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitteredBackoff {
    base: ExponentialBackoff,
    jitter: f64,
}

impl JitteredBackoff {
    pub fn new(base: ExponentialBackoff, jitter: f64) -> Self {
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self { base, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.delay(attempt);
        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(1.0 + spread).min(self.base.max_delay())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffPolicy {
    Exponential(ExponentialBackoff),
    Jittered(JitteredBackoff),
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Exponential(policy) => policy.delay(attempt),
            BackoffPolicy::Jittered(policy) => policy.delay(attempt),
        }
    }
}
