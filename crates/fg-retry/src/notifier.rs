//! Retry notifications

use tracing::{info, warn};

use crate::context::RetryContext;

/// Observer of a retry loop.
///
/// `on_failure` runs after every failed attempt; `on_success` runs once when
/// an attempt succeeds after at least one failure.
pub trait RetryNotifier: Send + Sync {
    fn on_failure(&self, context: &RetryContext);

    fn on_success(&self, context: &RetryContext);
}

#[derive(Debug, Default, Clone)]
pub struct LoggingRetryNotifier;

impl RetryNotifier for LoggingRetryNotifier {
    fn on_failure(&self, context: &RetryContext) {
        warn!(
            operation = %context.description(),
            attempt = context.attempt(),
            cause = context.last_failure().unwrap_or("unknown"),
            "Attempt failed"
        );
    }

    fn on_success(&self, context: &RetryContext) {
        info!(
            operation = %context.description(),
            attempt = context.attempt(),
            failures = context.failures(),
            "Recovered after retry"
        );
    }
}

/// Adapts a pair of closures into a notifier
pub struct FnRetryNotifier<F, S> {
    on_failure: F,
    on_success: S,
}

impl<F, S> FnRetryNotifier<F, S>
where
    F: Fn(&RetryContext) + Send + Sync,
    S: Fn(&RetryContext) + Send + Sync,
{
    pub fn new(on_failure: F, on_success: S) -> Self {
        Self {
            on_failure,
            on_success,
        }
    }
}

impl<F, S> RetryNotifier for FnRetryNotifier<F, S>
where
    F: Fn(&RetryContext) + Send + Sync,
    S: Fn(&RetryContext) + Send + Sync,
{
    fn on_failure(&self, context: &RetryContext) {
        (self.on_failure)(context)
    }

    fn on_success(&self, context: &RetryContext) {
        (self.on_success)(context)
    }
}
