use std::time::Duration;

use tripwire_common::BusConfig;

/// What to do with a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Negatively acknowledge; the transport redelivers after the delay.
    Retry(Duration),
    /// Publish to the dead-letter subject and acknowledge the original.
    DeadLetter,
}

/// Bounded exponential backoff: `base * 2^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&BusConfig::default())
    }
}

impl From<&BusConfig> for RetryPolicy {
    fn from(config: &BusConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.backoff_base,
            max_delay: config.max_backoff,
        }
    }
}

impl RetryPolicy {
    /// Disposition after the `attempt`-th delivery failed (1-based).
    pub fn disposition(&self, attempt: u32) -> Disposition {
        if attempt > self.max_retries {
            return Disposition::DeadLetter;
        }
        Disposition::Retry(self.delay_for(attempt))
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_from_base() {
        let policy = RetryPolicy::default();
        let delays: Vec<Duration> = (1..=5).map(|a| policy.delay_for(a)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]
        );
    }

    #[test]
    fn dead_letters_after_max_retries() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.disposition(5),
            Disposition::Retry(Duration::from_secs(8))
        );
        assert_eq!(policy.disposition(6), Disposition::DeadLetter);
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_retries: 50,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn zero_retries_dead_letters_first_failure() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.disposition(1), Disposition::DeadLetter);
    }
}
