//! Flowgate Polling Scheduler
//!
//! Drives a poll job at a fixed frequency after an initial delay:
//! - FixedFrequencyScheduler: the timer and its lifecycle state machine
//! - PollJob: the delegate invoked on every tick or manual trigger
//! - TimeUnit: unit for frequency and start delay

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod job;
pub mod scheduler;

pub use job::{FnJob, PollJob};
pub use scheduler::FixedFrequencyScheduler;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler {scheduler}: cannot {operation} while {state}")]
    InvalidState {
        scheduler: String,
        operation: &'static str,
        state: SchedulerState,
    },

    #[error("Scheduler {scheduler}: frequency must be greater than zero")]
    InvalidFrequency { scheduler: String },

    #[error("Unknown time unit: {0}")]
    InvalidTimeUnit(String),

    #[error("Scheduler {scheduler}: cannot {operation} outside a tokio runtime")]
    NoRuntime {
        scheduler: String,
        operation: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Lifecycle: Created -> Initialised -> Started <-> Stopped -> Disposed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerState {
    Created,
    Initialised,
    Started,
    Stopped,
    Disposed,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Created => "created",
            SchedulerState::Initialised => "initialised",
            SchedulerState::Started => "started",
            SchedulerState::Stopped => "stopped",
            SchedulerState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Convert an amount of this unit, saturating on overflow
    pub fn to_duration(self, amount: u64) -> Duration {
        let millis_per_unit: u64 = match self {
            TimeUnit::Milliseconds => 1,
            TimeUnit::Seconds => 1_000,
            TimeUnit::Minutes => 60_000,
            TimeUnit::Hours => 3_600_000,
            TimeUnit::Days => 86_400_000,
        };
        Duration::from_millis(amount.saturating_mul(millis_per_unit))
    }
}

impl FromStr for TimeUnit {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match fg_config::canonical_time_unit(s) {
            Some("milliseconds") => Ok(TimeUnit::Milliseconds),
            Some("seconds") => Ok(TimeUnit::Seconds),
            Some("minutes") => Ok(TimeUnit::Minutes),
            Some("hours") => Ok(TimeUnit::Hours),
            Some("days") => Ok(TimeUnit::Days),
            _ => Err(SchedulerError::InvalidTimeUnit(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_unit_conversion() {
        assert_eq!(TimeUnit::Hours.to_duration(10), Duration::from_secs(36_000));
        assert_eq!(TimeUnit::Milliseconds.to_duration(50), Duration::from_millis(50));
        assert_eq!(TimeUnit::Days.to_duration(u64::MAX), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_time_unit_parse() {
        assert_eq!("HOURS".parse::<TimeUnit>().unwrap(), TimeUnit::Hours);
        assert_eq!("ms".parse::<TimeUnit>().unwrap(), TimeUnit::Milliseconds);
        assert!("fortnights".parse::<TimeUnit>().is_err());
    }

    #[test]
    fn test_every_configurable_unit_parses() {
        for (alias, _) in fg_config::TIME_UNITS {
            assert!(alias.parse::<TimeUnit>().is_ok(), "{} should parse", alias);
        }
    }
}
