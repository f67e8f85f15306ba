//! Scheduler lifecycle and cadence tests
//!
//! Tests for:
//! - Lifecycle transitions, including start after stop and stop before start
//! - Manual triggering
//! - Regular cadence and error tolerance
//! - Polls never overlapping

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fg_scheduler::{FixedFrequencyScheduler, FnJob, PollJob, SchedulerError, SchedulerState, TimeUnit};
use tokio_test::{assert_err, assert_ok};

#[derive(Default)]
struct FlagJob {
    ran: AtomicBool,
}

#[async_trait]
impl PollJob for FlagJob {
    async fn run(&self) -> anyhow::Result<()> {
        self.ran.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Tracks how many polls run at the same time
#[derive(Default)]
struct SlowJob {
    running: AtomicU32,
    max_running: AtomicU32,
    completed: AtomicU32,
}

#[async_trait]
impl PollJob for SlowJob {
    async fn run(&self) -> anyhow::Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_happy_path_lifecycle() {
    let scheduler = FixedFrequencyScheduler::new("name", 10, 50, Arc::new(FlagJob::default()), TimeUnit::Hours);

    assert_ok!(scheduler.initialise());
    assert_ok!(scheduler.start());
    assert_eq!(scheduler.state(), SchedulerState::Started);
    assert_ok!(scheduler.stop());
    assert_ok!(scheduler.dispose());
    assert_eq!(scheduler.state(), SchedulerState::Disposed);
}

#[tokio::test]
async fn test_stop_without_start() {
    let scheduler = FixedFrequencyScheduler::new("name", 10, 50, Arc::new(FlagJob::default()), TimeUnit::Hours);

    assert_ok!(scheduler.initialise());
    assert_ok!(scheduler.stop());
    assert_eq!(scheduler.state(), SchedulerState::Initialised);
}

#[tokio::test]
async fn test_start_after_stop_then_schedule_runs_job() {
    let job = Arc::new(FlagJob::default());
    let scheduler = FixedFrequencyScheduler::new("name", 10, 50, job.clone(), TimeUnit::Hours);

    assert_ok!(scheduler.initialise());
    assert_ok!(scheduler.start());
    assert_ok!(scheduler.stop());
    assert_ok!(scheduler.start());
    assert!(!job.ran.load(Ordering::SeqCst));

    assert_ok!(scheduler.schedule());
    assert!(eventually(|| job.ran.load(Ordering::SeqCst)).await);

    assert_ok!(scheduler.dispose());
}

#[tokio::test]
async fn test_invalid_transitions() {
    let scheduler = FixedFrequencyScheduler::new("bad", 10, 0, Arc::new(FlagJob::default()), TimeUnit::Seconds);
    assert!(matches!(
        scheduler.start(),
        Err(SchedulerError::InvalidState { operation: "start", state: SchedulerState::Created, .. })
    ));
    assert_err!(scheduler.schedule());

    assert_ok!(scheduler.initialise());
    assert_err!(scheduler.initialise());

    assert_ok!(scheduler.dispose());
    assert_err!(scheduler.start());
    assert_err!(scheduler.stop());
    assert_err!(scheduler.schedule());
    // Disposing twice is harmless
    assert_ok!(scheduler.dispose());

    let zero = FixedFrequencyScheduler::new("zero", 0, 0, Arc::new(FlagJob::default()), TimeUnit::Seconds);
    assert!(matches!(zero.initialise(), Err(SchedulerError::InvalidFrequency { .. })));
}

#[tokio::test]
async fn test_timer_polls_and_survives_job_errors() {
    let calls = Arc::new(AtomicU32::new(0));
    let job_calls = calls.clone();
    let job = FnJob::new(move || {
        let calls = job_calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow::anyhow!("source unavailable"))
        }
    });

    let scheduler = FixedFrequencyScheduler::new("failing", 15, 0, Arc::new(job), TimeUnit::Milliseconds);
    assert_ok!(scheduler.initialise());
    assert_ok!(scheduler.start());

    assert!(eventually(|| calls.load(Ordering::SeqCst) >= 3).await);

    assert_ok!(scheduler.stop());
    tokio::time::sleep(Duration::from_millis(40)).await;
    let after_stop = calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(calls.load(Ordering::SeqCst), after_stop);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_polls_never_overlap() {
    let job = Arc::new(SlowJob::default());
    let scheduler = FixedFrequencyScheduler::new("slow", 10, 0, job.clone(), TimeUnit::Milliseconds);
    assert_ok!(scheduler.initialise());
    assert_ok!(scheduler.start());

    tokio::time::sleep(Duration::from_millis(30)).await;
    let manual = scheduler.schedule().unwrap();
    manual.await.unwrap();

    assert!(eventually(|| job.completed.load(Ordering::SeqCst) >= 3).await);
    assert_ok!(scheduler.dispose());

    assert_eq!(job.max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_from_config() {
    let config = fg_config::PollConfig {
        frequency: 10,
        start_delay: 50,
        time_unit: "hours".to_string(),
    };
    let scheduler = FixedFrequencyScheduler::from_config("poller", &config, Arc::new(FlagJob::default())).unwrap();

    assert_eq!(scheduler.name(), "poller");
    assert_eq!(scheduler.frequency(), Duration::from_secs(36_000));
    assert_eq!(scheduler.start_delay(), Duration::from_secs(180_000));

    let bad = fg_config::PollConfig {
        time_unit: "weeks".to_string(),
        ..Default::default()
    };
    assert!(matches!(
        FixedFrequencyScheduler::from_config("poller", &bad, Arc::new(FlagJob::default())),
        Err(SchedulerError::InvalidTimeUnit(_))
    ));
}

/// Counts polls that begin after the owner observed `stop()` returning
#[derive(Default)]
struct StopWatchJob {
    stopped: AtomicBool,
    started_after_stop: AtomicU32,
}

#[async_trait]
impl PollJob for StopWatchJob {
    async fn run(&self) -> anyhow::Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            self.started_after_stop.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_poll_starts_after_stop_mid_poll() {
    let mut leaked = 0;
    for _ in 0..40 {
        let job = Arc::new(StopWatchJob::default());
        let scheduler = FixedFrequencyScheduler::new("stopping", 5, 0, job.clone(), TimeUnit::Milliseconds);
        assert_ok!(scheduler.initialise());
        assert_ok!(scheduler.start());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_ok!(scheduler.stop());
        job.stopped.store(true, Ordering::SeqCst);

        // Outlast the running poll plus several periods
        tokio::time::sleep(Duration::from_millis(60)).await;
        leaked += job.started_after_stop.load(Ordering::SeqCst);
        assert_ok!(scheduler.dispose());
    }
    assert_eq!(leaked, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_mid_poll_does_not_overlap() {
    let job = Arc::new(SlowJob::default());
    let scheduler = FixedFrequencyScheduler::new("restart", 5, 0, job.clone(), TimeUnit::Milliseconds);
    assert_ok!(scheduler.initialise());
    assert_ok!(scheduler.start());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_ok!(scheduler.stop());
    assert_ok!(scheduler.start());

    assert!(eventually(|| job.completed.load(Ordering::SeqCst) >= 3).await);
    assert_ok!(scheduler.dispose());
    assert_eq!(job.max_running.load(Ordering::SeqCst), 1);
}

#[test]
fn test_start_outside_runtime_is_an_error() {
    let scheduler = FixedFrequencyScheduler::new("no-runtime", 10, 0, Arc::new(FlagJob::default()), TimeUnit::Seconds);
    assert_ok!(scheduler.initialise());

    assert!(matches!(
        scheduler.start(),
        Err(SchedulerError::NoRuntime { operation: "start", .. })
    ));
    assert_eq!(scheduler.state(), SchedulerState::Initialised);
    assert!(matches!(
        scheduler.schedule(),
        Err(SchedulerError::NoRuntime { operation: "schedule", .. })
    ));
}

#[tokio::test]
async fn test_from_config_accepts_unit_aliases() {
    let config = fg_config::PollConfig {
        frequency: 2,
        start_delay: 0,
        time_unit: "s".to_string(),
    };
    let scheduler = FixedFrequencyScheduler::from_config("alias", &config, Arc::new(FlagJob::default())).unwrap();
    assert_eq!(scheduler.frequency(), Duration::from_secs(2));
}
