use std::time::Duration;

/// Retry budget and backoff curve for one logical save cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of send attempts per cycle, including the first one.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_max: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(30),
            jitter_max: None,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `failures` failed sends.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts.max(1)
    }

    /// Delay before the retry that follows the `failures`-th failure:
    /// `base_backoff * 2^(failures - 1)`, capped at `max_backoff`, plus jitter.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let backoff = self
            .base_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);

        match self.jitter_max {
            Some(jitter_max) => {
                let jitter_ms = jitter_max.as_millis() as u64;
                let extra = if jitter_ms == 0 {
                    0
                } else {
                    rand::random::<u64>() % (jitter_ms + 1)
                };
                backoff + Duration::from_millis(extra)
            }
            None => backoff,
        }
    }
}
