//! Jitter strategies to spread out synchronized retries

use rand::Rng;
use std::time::Duration;

/// Jitter strategy applied on top of the backoff delay.
#[derive(Debug, Clone)]
pub enum Jitter {
    /// Use the exact backoff delay
    None,
    /// Random between 0 and the delay
    Full,
    /// Random between delay/2 and the delay
    Equal,
    /// AWS-style decorrelated jitter bounded by `[base, max]`
    Decorrelated { base: Duration, max: Duration },
}

impl Jitter {
    /// Full jitter.
    pub fn full() -> Self {
        Jitter::Full
    }

    /// Equal jitter.
    pub fn equal() -> Self {
        Jitter::Equal
    }

    /// Decorrelated jitter.
    pub fn decorrelated(base: Duration, max: Duration) -> Self {
        Jitter::Decorrelated { base, max }
    }

    /// Apply jitter to a delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-supplied RNG (deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Equal => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                let half = millis / 2;
                Duration::from_millis(rng.random_range(half..=millis))
            }
            Jitter::Decorrelated { base, max } => {
                // sleep = min(max, random(base, previous * 3)); the backoff
                // delay stands in for the previous sleep.
                let base_millis = base.as_millis() as u64;
                let delay_millis = delay.as_millis() as u64;
                let max_millis = max.as_millis() as u64;

                let upper = delay_millis.saturating_mul(3).min(max_millis);
                if base_millis >= upper {
                    return Duration::from_millis(base_millis);
                }
                Duration::from_millis(rng.random_range(base_millis..=upper))
            }
        }
    }
}
