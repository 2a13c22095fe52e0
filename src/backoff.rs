//! Backoff schedules for the retry driver

use std::time::Duration;

/// Delay schedule between attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Same delay before every retry
    Constant { delay: Duration },
    /// Delay grows linearly with the attempt number
    Linear { base: Duration },
    /// Delay doubles per attempt, optionally capped
    Exponential { base: Duration, cap: Option<Duration> },
}

impl Backoff {
    /// Fixed delay between retries.
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    /// Linearly increasing delay: `base * attempt`.
    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base }
    }

    /// Exponentially increasing delay: `base * 2^(attempt-1)`.
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, cap: None }
    }

    /// Cap the exponential delay. No effect on other schedules.
    pub fn with_cap(mut self, cap: Duration) -> Self {
        if let Backoff::Exponential { cap: ref mut c, .. } = self {
            *c = Some(cap);
        }
        self
    }

    /// Delay before the retry following attempt `attempt` (1-indexed).
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Linear { base } => {
                base.checked_mul(attempt as u32).unwrap_or(Duration::from_secs(u64::MAX))
            }
            Backoff::Exponential { base, cap } => {
                let exponent = (attempt.saturating_sub(1)) as u32;
                let multiplier = 2u32.saturating_pow(exponent);
                let delay =
                    base.checked_mul(multiplier).unwrap_or(Duration::from_secs(u64::MAX));
                match cap {
                    Some(cap) => delay.min(*cap),
                    None => delay,
                }
            }
        }
    }
}

impl Default for Backoff {
    /// Exponential with a 500 ms initial interval.
    fn default() -> Self {
        Backoff::exponential(Duration::from_millis(500))
    }
}
