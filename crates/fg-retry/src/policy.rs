//! Retry policies
//!
//! A policy is consulted after each failed attempt with the number of
//! failures so far and answers with the delay before the next attempt, or
//! `None` when the budget is spent.

use std::time::Duration;

use tracing::warn;

pub trait RetryPolicy: Send + Sync {
    fn next_delay(&self, failures: u32) -> Option<Duration>;

    fn describe(&self) -> String;
}

/// Built-in policies
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicyKind {
    /// Fail on the first error
    NoRetry,
    /// Up to `count` retries after the first attempt, `delay` apart
    FixedCount { count: u32, delay: Duration },
    /// Retry without limit, `delay` apart
    Forever { delay: Duration },
    /// Delays grow by `multiplier` from `initial` up to `max_delay`.
    /// With `jitter` each delay is drawn uniformly from zero to the computed value.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max_delay: Duration,
        max_retries: Option<u32>,
        jitter: bool,
    },
}

impl Default for RetryPolicyKind {
    fn default() -> Self {
        Self::FixedCount {
            count: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicyKind {
    pub fn from_config(config: &fg_config::RetryConfig) -> Self {
        match config.policy.to_ascii_lowercase().as_str() {
            "none" => Self::NoRetry,
            "fixed" => Self::FixedCount {
                count: config.count,
                delay: config.frequency(),
            },
            "forever" => Self::Forever {
                delay: config.frequency(),
            },
            "exponential" => Self::Exponential {
                initial: config.frequency(),
                multiplier: config.multiplier,
                max_delay: config.max_delay(),
                max_retries: Some(config.count),
                jitter: config.jitter,
            },
            other => {
                warn!(policy = %other, "Unknown retry policy, using fixed count");
                Self::FixedCount {
                    count: config.count,
                    delay: config.frequency(),
                }
            }
        }
    }

    fn exponential_delay(initial: Duration, multiplier: f64, max_delay: Duration, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = initial.as_secs_f64() * multiplier.max(1.0).powi(exponent);
        let capped = secs.min(max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            max_delay
        }
    }
}

impl RetryPolicy for RetryPolicyKind {
    fn next_delay(&self, failures: u32) -> Option<Duration> {
        match self {
            Self::NoRetry => None,
            Self::FixedCount { count, delay } => (failures <= *count).then_some(*delay),
            Self::Forever { delay } => Some(*delay),
            Self::Exponential {
                initial,
                multiplier,
                max_delay,
                max_retries,
                jitter,
            } => {
                if max_retries.is_some_and(|max| failures > max) {
                    return None;
                }
                let delay = Self::exponential_delay(*initial, *multiplier, *max_delay, failures);
                if *jitter {
                    Some(delay.mul_f64(rand::random::<f64>()))
                } else {
                    Some(delay)
                }
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::NoRetry => "no retry".to_string(),
            Self::FixedCount { count, delay } => {
                format!("{} retries every {}ms", count, delay.as_millis())
            }
            Self::Forever { delay } => format!("retry forever every {}ms", delay.as_millis()),
            Self::Exponential {
                initial,
                multiplier,
                max_delay,
                max_retries,
                ..
            } => format!(
                "exponential from {}ms x{} up to {}ms, {} retries",
                initial.as_millis(),
                multiplier,
                max_delay.as_millis(),
                max_retries.map_or_else(|| "unlimited".to_string(), |m| m.to_string())
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_count_budget() {
        let policy = RetryPolicyKind::FixedCount {
            count: 3,
            delay: Duration::from_millis(5),
        };
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(5)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(5)));
        assert_eq!(policy.next_delay(4), None);
        assert_eq!(RetryPolicyKind::NoRetry.next_delay(1), None);
    }

    #[test]
    fn test_exponential_growth_and_cap() {
        let policy = RetryPolicyKind::Exponential {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(500),
            max_retries: Some(10),
            jitter: false,
        };
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.next_delay(4), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_delay(10), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_delay(11), None);
    }

    #[test]
    fn test_exponential_jitter_stays_below_delay() {
        let policy = RetryPolicyKind::Exponential {
            initial: Duration::from_millis(100),
            multiplier: 3.0,
            max_delay: Duration::from_secs(1),
            max_retries: None,
            jitter: true,
        };
        for failures in 1..50 {
            let delay = policy.next_delay(failures).unwrap();
            assert!(delay <= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_from_config() {
        let mut config = fg_config::RetryConfig::default();
        assert_eq!(
            RetryPolicyKind::from_config(&config),
            RetryPolicyKind::FixedCount {
                count: 3,
                delay: Duration::from_secs(2)
            }
        );

        config.policy = "forever".to_string();
        assert!(matches!(
            RetryPolicyKind::from_config(&config),
            RetryPolicyKind::Forever { .. }
        ));

        config.policy = "exponential".to_string();
        let policy = RetryPolicyKind::from_config(&config);
        assert!(policy.describe().starts_with("exponential"));
    }
}
