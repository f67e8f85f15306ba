//! Retry template integration tests
//!
//! Tests for:
//! - Notifier calls across failures and recovery
//! - Exhaustion surfaces the last error
//! - Single in-flight loop for the async template
//! - Cancellation during backoff

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fg_retry::{
    AsyncRetryTemplate, FnRetryNotifier, RetryContext, RetryError, RetryNotifier, RetryPolicyKind,
    RetryPolicyTemplate, Submission,
};
use parking_lot::Mutex;

#[derive(Default)]
struct CountingNotifier {
    failures: AtomicU32,
    successes: AtomicU32,
    causes: Mutex<Vec<String>>,
}

impl RetryNotifier for CountingNotifier {
    fn on_failure(&self, context: &RetryContext) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        self.causes
            .lock()
            .push(context.last_failure().unwrap_or_default().to_string());
    }

    fn on_success(&self, _context: &RetryContext) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }
}

fn fixed(count: u32, delay_ms: u64) -> RetryPolicyTemplate {
    RetryPolicyTemplate::new(Arc::new(RetryPolicyKind::FixedCount {
        count,
        delay: Duration::from_millis(delay_ms),
    }))
}

#[tokio::test]
async fn test_two_failures_then_success() {
    let notifier = Arc::new(CountingNotifier::default());
    let template = fixed(3, 1).with_notifier(notifier.clone());
    let calls = Arc::new(AtomicU32::new(0));

    let result = template
        .execute("connect to bank", |_| {
            let calls = calls.clone();
            async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err("connection refused".to_string()),
                    _ => Ok("connected"),
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "connected");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(notifier.failures.load(Ordering::SeqCst), 2);
    assert_eq!(notifier.successes.load(Ordering::SeqCst), 1);
    assert_eq!(*notifier.causes.lock(), vec!["connection refused"; 2]);
}

#[tokio::test]
async fn test_first_attempt_success_does_not_notify() {
    let notifier = Arc::new(CountingNotifier::default());
    let template = fixed(3, 1).with_notifier(notifier.clone());

    let value = template.execute("ok", |_| async { Ok::<_, String>(1) }).await.unwrap();

    assert_eq!(value, 1);
    assert_eq!(notifier.failures.load(Ordering::SeqCst), 0);
    assert_eq!(notifier.successes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_exhaustion_returns_last_error() {
    let notifier = Arc::new(CountingNotifier::default());
    let template = fixed(2, 1).with_notifier(notifier.clone());
    let calls = Arc::new(AtomicU32::new(0));

    let err = template
        .execute("always fails", |ctx| {
            let attempt = ctx.attempt();
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(format!("failure {}", attempt)) }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(err.attempts(), 3);
    assert_eq!(notifier.failures.load(Ordering::SeqCst), 3);
    assert_eq!(notifier.successes.load(Ordering::SeqCst), 0);
    assert_eq!(err.into_last_error(), Some("failure 3".to_string()));
}

#[tokio::test]
async fn test_fn_notifier() {
    let failures = Arc::new(AtomicU32::new(0));
    let counted = failures.clone();
    let notifier = FnRetryNotifier::new(
        move |_: &RetryContext| {
            counted.fetch_add(1, Ordering::SeqCst);
        },
        |_: &RetryContext| {},
    );
    let template = fixed(1, 1).with_notifier(Arc::new(notifier));

    let _ = template.execute("x", |_| async { Err::<(), _>("e") }).await;
    assert_eq!(failures.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_async_template_returns_immediately_and_runs_once() {
    let template = AsyncRetryTemplate::new(fixed(5, 20));
    let calls = Arc::new(AtomicU32::new(0));

    let op_calls = calls.clone();
    let submission = template.submit("reconnect", move |_| {
        let calls = op_calls.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("down".to_string())
            } else {
                Ok(())
            }
        }
    });
    assert!(submission.is_started());
    assert!(template.is_in_flight());

    // A second loop must not start while the first is running
    let second = template.submit("reconnect", |_| async { Ok::<(), String>(()) });
    assert!(matches!(second, Submission::AlreadyInFlight));

    let handle = submission.into_handle().unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(!template.is_in_flight());

    // Free again once the loop finished
    let third = template.submit("reconnect", |_| async { Ok::<(), String>(()) });
    third.into_handle().unwrap().await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancel_stops_backoff() {
    let template = AsyncRetryTemplate::new(RetryPolicyTemplate::new(Arc::new(
        RetryPolicyKind::Forever {
            delay: Duration::from_secs(30),
        },
    )));

    let handle = template
        .submit("forever", |_| async { Err::<(), _>("unreachable host") })
        .into_handle()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(template.cancel());

    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("cancelled loop should finish promptly")
        .unwrap();

    assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1, .. })));
    assert!(!template.is_in_flight());
}
