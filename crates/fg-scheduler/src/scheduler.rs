//! Fixed-frequency scheduler
//!
//! A started scheduler owns one ticker task. Every poll, whether from a tick
//! or from `schedule()`, runs under the same run lock, so polls never
//! overlap: a tick that finds a poll running is skipped, while a manual
//! trigger waits for the running poll to finish.
//!
//! Once `stop()` returns no further timer poll begins, although a poll
//! already in progress runs to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Mutex as RunLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::job::PollJob;
use crate::{Result, SchedulerError, SchedulerState, TimeUnit};

struct Timer {
    shutdown: broadcast::Sender<()>,
    /// Checked under the run lock before every timer poll
    stopped: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Timer {
    fn shut_down(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.shutdown.send(());
    }
}

/// Lifecycle state; the lock is never held across an await
struct Inner {
    state: SchedulerState,
    timer: Option<Timer>,
}

pub struct FixedFrequencyScheduler {
    name: String,
    frequency: u64,
    start_delay: u64,
    unit: TimeUnit,
    job: Arc<dyn PollJob>,
    run_lock: Arc<RunLock<()>>,
    inner: Mutex<Inner>,
}

impl FixedFrequencyScheduler {
    /// `frequency` and `start_delay` are expressed in `unit`
    pub fn new(
        name: impl Into<String>,
        frequency: u64,
        start_delay: u64,
        job: Arc<dyn PollJob>,
        unit: TimeUnit,
    ) -> Self {
        Self {
            name: name.into(),
            frequency,
            start_delay,
            unit,
            job,
            run_lock: Arc::new(RunLock::new(())),
            inner: Mutex::new(Inner {
                state: SchedulerState::Created,
                timer: None,
            }),
        }
    }

    pub fn from_config(
        name: impl Into<String>,
        config: &fg_config::PollConfig,
        job: Arc<dyn PollJob>,
    ) -> Result<Self> {
        let unit: TimeUnit = config.time_unit.parse()?;
        Ok(Self::new(name, config.frequency, config.start_delay, job, unit))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.lock().state
    }

    pub fn frequency(&self) -> Duration {
        self.unit.to_duration(self.frequency)
    }

    pub fn start_delay(&self) -> Duration {
        self.unit.to_duration(self.start_delay)
    }

    /// Validate configuration. No task is started.
    pub fn initialise(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != SchedulerState::Created {
            return Err(self.invalid("initialise", inner.state));
        }
        if self.frequency == 0 {
            return Err(SchedulerError::InvalidFrequency {
                scheduler: self.name.clone(),
            });
        }
        inner.state = SchedulerState::Initialised;
        debug!(scheduler = %self.name, "Scheduler initialised");
        Ok(())
    }

    /// Begin polling after the start delay. Also resumes a stopped scheduler.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            SchedulerState::Initialised | SchedulerState::Stopped => {
                let runtime = self.runtime("start")?;
                inner.timer = Some(self.spawn_timer(&runtime));
                inner.state = SchedulerState::Started;
                info!(
                    scheduler = %self.name,
                    frequency_ms = self.frequency().as_millis() as u64,
                    start_delay_ms = self.start_delay().as_millis() as u64,
                    "Scheduler started"
                );
                Ok(())
            }
            SchedulerState::Started => {
                debug!(scheduler = %self.name, "Scheduler already started");
                Ok(())
            }
            state => Err(self.invalid("start", state)),
        }
    }

    /// Stop the timer. A poll already running is allowed to finish.
    /// Stopping a scheduler that never started is a no-op.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            SchedulerState::Started => {
                if let Some(timer) = inner.timer.take() {
                    timer.shut_down();
                }
                inner.state = SchedulerState::Stopped;
                info!(scheduler = %self.name, "Scheduler stopped");
                Ok(())
            }
            SchedulerState::Created | SchedulerState::Initialised | SchedulerState::Stopped => {
                debug!(scheduler = %self.name, state = %state, "Stop ignored, scheduler not running");
                Ok(())
            }
            SchedulerState::Disposed => Err(self.invalid("stop", state)),
        }
    }

    /// Run the job once now, outside the regular cadence.
    ///
    /// Waits for a poll that is already running instead of overlapping it.
    pub fn schedule(&self) -> Result<JoinHandle<()>> {
        let state = self.state();
        if matches!(state, SchedulerState::Created | SchedulerState::Disposed) {
            return Err(self.invalid("schedule", state));
        }
        let runtime = self.runtime("schedule")?;

        let name = self.name.clone();
        let job = self.job.clone();
        let run_lock = self.run_lock.clone();
        debug!(scheduler = %name, "Manual poll requested");

        Ok(runtime.spawn(async move {
            let _running = run_lock.lock().await;
            run_job(&name, job.as_ref(), "manual").await;
        }))
    }

    /// Stop the timer and release it. The scheduler cannot be used afterwards.
    pub fn dispose(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == SchedulerState::Disposed {
            return Ok(());
        }
        if let Some(timer) = inner.timer.take() {
            timer.shut_down();
            timer.handle.abort();
        }
        inner.state = SchedulerState::Disposed;
        info!(scheduler = %self.name, "Scheduler disposed");
        Ok(())
    }

    fn invalid(&self, operation: &'static str, state: SchedulerState) -> SchedulerError {
        warn!(scheduler = %self.name, operation = operation, state = %state, "Invalid scheduler transition");
        SchedulerError::InvalidState {
            scheduler: self.name.clone(),
            operation,
            state,
        }
    }

    fn runtime(&self, operation: &'static str) -> Result<Handle> {
        Handle::try_current().map_err(|_| {
            warn!(scheduler = %self.name, operation = operation, "No tokio runtime available");
            SchedulerError::NoRuntime {
                scheduler: self.name.clone(),
                operation,
            }
        })
    }

    fn spawn_timer(&self, runtime: &Handle) -> Timer {
        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let stopped = Arc::new(AtomicBool::new(false));
        let timer_stopped = stopped.clone();
        let name = self.name.clone();
        let job = self.job.clone();
        let run_lock = self.run_lock.clone();
        let start_delay = self.start_delay();
        let period = self.frequency();

        let handle = runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    debug!(scheduler = %name, "Stopped before first poll");
                    return;
                }
                _ = tokio::time::sleep(start_delay) => {}
            }

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        debug!(scheduler = %name, "Timer shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match run_lock.clone().try_lock_owned() {
                            // stop() may have landed while this tick waited
                            Ok(_) if timer_stopped.load(Ordering::Acquire) => break,
                            Ok(_running) => run_job(&name, job.as_ref(), "timer").await,
                            Err(_) => {
                                debug!(scheduler = %name, "Previous poll still running, tick skipped");
                                counter!("fg_polls_skipped_total", "scheduler" => name.clone()).increment(1);
                            }
                        }
                    }
                }
            }
        });

        Timer {
            shutdown,
            stopped,
            handle,
        }
    }
}

impl Drop for FixedFrequencyScheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.get_mut().timer.take() {
            timer.handle.abort();
        }
    }
}

async fn run_job(name: &str, job: &dyn PollJob, trigger: &'static str) {
    let started = Instant::now();
    let result = job.run().await;
    histogram!("fg_poll_duration_seconds", "scheduler" => name.to_string())
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(()) => {
            counter!("fg_polls_total", "scheduler" => name.to_string(), "trigger" => trigger).increment(1);
        }
        Err(e) => {
            error!(scheduler = %name, trigger = trigger, error = %e, "Poll job failed");
            counter!("fg_poll_errors_total", "scheduler" => name.to_string()).increment(1);
        }
    }
}
