//! Retry policy: decides when a crashed record becomes claimable again.

use std::time::Duration;

/// Delay before the next execution of a crashed task.
///
/// `delay = base_delay * multiplier^(executions - 1)`. With `multiplier = 1.0`
/// every retry waits `base_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            multiplier: 1.0,
        }
    }

    pub fn exponential(base_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            multiplier,
        }
    }

    /// `executions` counts the run that just crashed (1-indexed).
    pub fn next_delay(&self, executions: u32) -> Duration {
        let exponent = executions.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 30)]
    #[case(2, 30)]
    #[case(5, 30)]
    fn fixed_policy_never_grows(#[case] executions: u32, #[case] expected: u64) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(executions), Duration::from_secs(expected));
    }

    #[rstest]
    #[case(0, 2)]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    fn exponential_backoff_increases(#[case] executions: u32, #[case] expected: u64) {
        let policy = RetryPolicy::exponential(Duration::from_secs(2), 2.0);
        assert_eq!(policy.next_delay(executions), Duration::from_secs(expected));
    }

    #[test]
    fn huge_exponents_saturate() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1), 10.0);
        assert_eq!(policy.next_delay(10_000), Duration::MAX);
    }
}
