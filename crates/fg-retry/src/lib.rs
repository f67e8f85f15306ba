//! Flowgate Retry
//!
//! Re-executes fallible async operations under a retry policy:
//! - RetryPolicy: decides whether another attempt is allowed and how long to wait
//! - RetryNotifier: observer called after every failed attempt and on recovery
//! - RetryPolicyTemplate: runs the retry loop on the caller's task
//! - AsyncRetryTemplate: runs at most one retry loop at a time on a background task

use thiserror::Error;

pub mod context;
pub mod notifier;
pub mod policy;
pub mod template;

pub use context::RetryContext;
pub use notifier::{FnRetryNotifier, LoggingRetryNotifier, RetryNotifier};
pub use policy::{RetryPolicy, RetryPolicyKind};
pub use template::{AsyncRetryTemplate, RetryPolicyTemplate, Submission};

/// Terminal outcome of a retry loop that did not succeed
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// The policy allowed no further attempts
    #[error("{description}: retries exhausted after {attempts} attempt(s): {last_error}")]
    Exhausted {
        description: String,
        attempts: u32,
        last_error: E,
    },

    /// The loop was cancelled before it succeeded
    #[error("{description}: cancelled after {attempts} attempt(s)")]
    Cancelled { description: String, attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    /// The error of the final attempt, if the loop ran out of retries
    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last_error, .. } => Some(last_error),
            RetryError::Cancelled { .. } => None,
        }
    }
}

pub type Result<T, E> = std::result::Result<T, RetryError<E>>;
