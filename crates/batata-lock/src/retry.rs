//! Retry policy for lost contention rounds

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Decision taken after a losing round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then try again
    Retry(Duration),
    /// Give up; surfaces as `AcquireError::Exhausted`
    Stop,
}

/// Delay schedule between attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        #[serde(default = "default_fixed_delay")]
        delay_ms: u64,
    },
    Exponential {
        #[serde(default = "default_initial_delay")]
        initial_delay_ms: u64,
        #[serde(default = "default_max_delay")]
        max_delay_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

/// Governs backoff and attempt bounding when acquisition loses a round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub backoff: Backoff,
    /// Maximum number of attempts, including the first (None = unbounded).
    /// The first attempt always runs, so 0 behaves as 1.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Maximum total time spent acquiring in milliseconds (None = unbounded)
    #[serde(default)]
    pub max_elapsed_ms: Option<u64>,
    /// Jitter factor (0.0 to 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Whether store errors count as a retryable round
    #[serde(default = "default_true")]
    pub retry_store_errors: bool,
}

fn default_fixed_delay() -> u64 {
    1000
}

fn default_initial_delay() -> u64 {
    100
}

fn default_max_delay() -> u64 {
    10000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            max_attempts: None,
            max_elapsed_ms: None,
            jitter: default_jitter(),
            retry_store_errors: true,
        }
    }
}

impl RetryPolicy {
    /// Constant delay between attempts, no jitter, unbounded
    pub fn fixed(delay: Duration) -> Self {
        Self {
            backoff: Backoff::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
            jitter: 0.0,
            ..Default::default()
        }
    }

    /// Doubling delay starting at `initial`, capped at `max`
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            backoff: Backoff::Exponential {
                initial_delay_ms: initial.as_millis() as u64,
                max_delay_ms: max.as_millis() as u64,
                multiplier: default_multiplier(),
            },
            ..Default::default()
        }
    }

    /// Give up after the first losing round
    pub fn no_retry() -> Self {
        Self::fixed(Duration::ZERO).with_max_attempts(1)
    }

    /// Bound the number of attempts; 0 is raised to 1
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed_ms = Some(max_elapsed.as_millis() as u64);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_store_error_retry(mut self, enabled: bool) -> Self {
        self.retry_store_errors = enabled;
        self
    }

    /// Delay before the next attempt, before jitter (1-indexed losing round)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let delay_ms = match &self.backoff {
            Backoff::Fixed { delay_ms } => *delay_ms as f64,
            Backoff::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let base = *initial_delay_ms as f64 * multiplier.powi(exponent);
                base.min(*max_delay_ms as f64)
            }
        };
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Decide what to do after `attempt` losing rounds, `elapsed` after the first attempt started
    pub fn next_delay(&self, attempt: u32, elapsed: Duration) -> RetryDecision {
        if let Some(max_attempts) = self.max_attempts
            && attempt >= max_attempts.max(1)
        {
            return RetryDecision::Stop;
        }

        let base = self.base_delay(attempt).as_millis() as f64;
        let jitter_range = base * self.jitter.clamp(0.0, 1.0);
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;
        let delay = Duration::from_millis((base + jitter).max(0.0) as u64);

        if let Some(max_elapsed_ms) = self.max_elapsed_ms
            && elapsed + delay > Duration::from_millis(max_elapsed_ms)
        {
            return RetryDecision::Stop;
        }

        RetryDecision::Retry(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::fixed(Duration::from_secs(1));
        for attempt in 1..10 {
            assert_eq!(
                policy.next_delay(attempt, Duration::ZERO),
                RetryDecision::Retry(Duration::from_secs(1))
            );
        }
    }

    #[test]
    fn test_exponential_delay_capped() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_millis(1000))
            .with_jitter(0.0);

        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(4), Duration::from_millis(800));
        assert_eq!(policy.base_delay(5), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(500), Duration::from_millis(1000));
    }

    #[test]
    fn test_max_attempts() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(3);
        assert!(matches!(
            policy.next_delay(1, Duration::ZERO),
            RetryDecision::Retry(_)
        ));
        assert!(matches!(
            policy.next_delay(2, Duration::ZERO),
            RetryDecision::Retry(_)
        ));
        assert_eq!(policy.next_delay(3, Duration::ZERO), RetryDecision::Stop);
    }

    #[test]
    fn test_zero_max_attempts_means_one() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(0);
        assert_eq!(policy.max_attempts, Some(1));
        assert_eq!(policy.next_delay(1, Duration::ZERO), RetryDecision::Stop);

        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 0}"#).unwrap();
        assert_eq!(policy.next_delay(1, Duration::ZERO), RetryDecision::Stop);
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.next_delay(1, Duration::ZERO), RetryDecision::Stop);
    }

    #[test]
    fn test_max_elapsed() {
        let policy = RetryPolicy::fixed(Duration::from_millis(100))
            .with_max_elapsed(Duration::from_millis(250));
        assert!(matches!(
            policy.next_delay(1, Duration::from_millis(100)),
            RetryDecision::Retry(_)
        ));
        assert_eq!(
            policy.next_delay(2, Duration::from_millis(200)),
            RetryDecision::Stop
        );
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"backoff": {"kind": "fixed"}, "max_attempts": 5}"#,
        )
        .unwrap();
        assert_eq!(policy.backoff, Backoff::Fixed { delay_ms: 1000 });
        assert_eq!(policy.max_attempts, Some(5));
        assert!(policy.retry_store_errors);

        let policy: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy, RetryPolicy::default());
    }

    proptest! {
        #[test]
        fn prop_jittered_delay_within_bounds(
            attempt in 1u32..64,
            jitter in 0.0f64..=1.0,
            initial in 1u64..2_000,
            cap in 1u64..60_000,
        ) {
            let policy = RetryPolicy::exponential(
                Duration::from_millis(initial),
                Duration::from_millis(cap),
            )
            .with_jitter(jitter);

            let base = policy.base_delay(attempt).as_millis() as f64;
            prop_assert!(base <= cap as f64);

            match policy.next_delay(attempt, Duration::ZERO) {
                RetryDecision::Retry(delay) => {
                    let delay = delay.as_millis() as f64;
                    prop_assert!(delay <= base * (1.0 + jitter) + 1.0);
                    prop_assert!(delay >= (base * (1.0 - jitter) - 1.0).max(0.0));
                }
                RetryDecision::Stop => prop_assert!(false, "unbounded policy stopped"),
            }
        }

        #[test]
        fn prop_stops_exactly_at_max_attempts(max in 1u32..50) {
            let policy = RetryPolicy::fixed(Duration::from_millis(1)).with_max_attempts(max);
            for attempt in 1..max {
                let retrying = matches!(policy.next_delay(attempt, Duration::ZERO), RetryDecision::Retry(_));
                prop_assert!(retrying);
            }
            prop_assert_eq!(policy.next_delay(max, Duration::ZERO), RetryDecision::Stop);
        }
    }
}
