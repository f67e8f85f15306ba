//! Retry templates
//!
//! `RetryPolicyTemplate::execute` keeps the caller waiting through every
//! attempt and backoff sleep. `AsyncRetryTemplate::submit` hands the same
//! loop to a background task and returns at once; a template never runs two
//! loops concurrently.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::context::RetryContext;
use crate::notifier::{LoggingRetryNotifier, RetryNotifier};
use crate::policy::{RetryPolicy, RetryPolicyKind};
use crate::{Result, RetryError};

pub struct RetryPolicyTemplate {
    policy: Arc<dyn RetryPolicy>,
    notifier: Arc<dyn RetryNotifier>,
    metadata: BTreeMap<String, String>,
}

impl RetryPolicyTemplate {
    pub fn new(policy: Arc<dyn RetryPolicy>) -> Self {
        Self {
            policy,
            notifier: Arc::new(LoggingRetryNotifier),
            metadata: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &fg_config::RetryConfig) -> Self {
        Self::new(Arc::new(RetryPolicyKind::from_config(config)))
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn RetryNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Metadata copied into every context this template creates
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn policy(&self) -> &dyn RetryPolicy {
        self.policy.as_ref()
    }

    /// Run `operation` until it succeeds or the policy gives up.
    ///
    /// Returns `RetryError::Exhausted` carrying the last error once the budget
    /// is spent; individual failures before that are only seen by the notifier.
    pub async fn execute<T, E, F, Fut>(&self, description: &str, operation: F) -> Result<T, E>
    where
        F: FnMut(&RetryContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        self.run(description, operation, None).await
    }

    async fn run<T, E, F, Fut>(
        &self,
        description: &str,
        mut operation: F,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<T, E>
    where
        F: FnMut(&RetryContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let mut context = RetryContext::new(description, self.metadata.clone());

        loop {
            if cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
                return Err(cancelled(&context));
            }

            context.begin_attempt();
            counter!("fg_retry_attempts_total").increment(1);

            let error = match operation(&context).await {
                Ok(value) => {
                    if context.failures() > 0 {
                        counter!("fg_retry_recovered_total").increment(1);
                        self.notifier.on_success(&context);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            context.record_failure(error.to_string());
            counter!("fg_retry_failures_total").increment(1);
            self.notifier.on_failure(&context);

            let delay = match self.policy.next_delay(context.failures()) {
                Some(delay) => delay,
                None => {
                    counter!("fg_retry_exhausted_total").increment(1);
                    error!(
                        operation = %description,
                        attempts = context.attempt(),
                        policy = %self.policy.describe(),
                        error = %error,
                        "Retries exhausted"
                    );
                    return Err(RetryError::Exhausted {
                        description: description.to_string(),
                        attempts: context.attempt(),
                        last_error: error,
                    });
                }
            };

            debug!(
                operation = %description,
                attempt = context.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Retrying"
            );

            match cancel.as_mut() {
                None => tokio::time::sleep(delay).await,
                Some(rx) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = rx.changed() => {
                            // A dropped sender cannot cancel any more; finish the sleep
                            if changed.is_err() {
                                tokio::time::sleep(delay).await;
                            }
                        }
                    }
                }
            }
        }
    }
}

fn cancelled<E>(context: &RetryContext) -> RetryError<E> {
    info!(
        operation = %context.description(),
        attempts = context.attempt(),
        "Retry loop cancelled"
    );
    RetryError::Cancelled {
        description: context.description().to_string(),
        attempts: context.attempt(),
    }
}

/// Result of submitting work to an `AsyncRetryTemplate`
pub enum Submission<T, E> {
    Started(JoinHandle<Result<T, E>>),
    /// Another loop of this template is still running; nothing was started
    AlreadyInFlight,
}

impl<T, E> Submission<T, E> {
    pub fn is_started(&self) -> bool {
        matches!(self, Submission::Started(_))
    }

    pub fn into_handle(self) -> Option<JoinHandle<Result<T, E>>> {
        match self {
            Submission::Started(handle) => Some(handle),
            Submission::AlreadyInFlight => None,
        }
    }
}

/// Clears the in-flight flag when the background loop ends, however it ends
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct AsyncRetryTemplate {
    template: Arc<RetryPolicyTemplate>,
    in_flight: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
}

impl AsyncRetryTemplate {
    pub fn new(template: RetryPolicyTemplate) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            template: Arc::new(template),
            in_flight: Arc::new(AtomicBool::new(false)),
            cancel_tx,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Start a retry loop in the background unless one is already running
    pub fn submit<T, E, F, Fut>(&self, description: impl Into<String>, operation: F) -> Submission<T, E>
    where
        F: FnMut(&RetryContext) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let description = description.into();

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(operation = %description, "Retry loop already in flight, submission ignored");
            counter!("fg_retry_submissions_rejected_total").increment(1);
            return Submission::AlreadyInFlight;
        }

        self.cancel_tx.send_replace(false);
        let cancel_rx = self.cancel_tx.subscribe();
        let guard = InFlightGuard(self.in_flight.clone());
        let template = self.template.clone();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            template.run(&description, operation, Some(cancel_rx)).await
        });

        Submission::Started(handle)
    }

    /// Stop the running loop at its next attempt boundary or backoff sleep.
    /// Returns whether a loop was in flight.
    pub fn cancel(&self) -> bool {
        let in_flight = self.is_in_flight();
        if in_flight {
            self.cancel_tx.send_replace(true);
        }
        in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast(count: u32) -> RetryPolicyTemplate {
        RetryPolicyTemplate::new(Arc::new(RetryPolicyKind::FixedCount {
            count,
            delay: Duration::from_millis(1),
        }))
    }

    #[tokio::test]
    async fn test_context_exposes_attempt_and_metadata() {
        let template = fast(2).with_metadata("endpoint", "bank-a");
        let mut seen = Vec::new();

        let result: Result<u32, String> = template
            .execute("connect", |ctx| {
                seen.push((ctx.attempt(), ctx.metadata()["endpoint"].clone()));
                let attempt = ctx.attempt();
                async move {
                    if attempt < 2 {
                        Err("refused".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(seen, vec![(1, "bank-a".to_string()), (2, "bank-a".to_string())]);
    }

    #[tokio::test]
    async fn test_no_retry_fails_on_first_error() {
        let template = RetryPolicyTemplate::new(Arc::new(RetryPolicyKind::NoRetry));
        let err = template
            .execute("once", |_| async { Err::<(), _>("nope") })
            .await
            .unwrap_err();

        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.to_string(), "once: retries exhausted after 1 attempt(s): nope");
    }

    #[tokio::test]
    async fn test_submission_guard_clears_flag_on_completion() {
        let template = AsyncRetryTemplate::new(fast(0));
        let handle = template
            .submit("quick", |_| async { Ok::<_, String>(7) })
            .into_handle()
            .unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), 7);
        assert!(!template.is_in_flight());
        assert!(!template.cancel());
    }
}
