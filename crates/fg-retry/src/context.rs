use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// State of one retry loop, visible to the operation and to notifiers
#[derive(Debug, Clone)]
pub struct RetryContext {
    description: String,
    attempt: u32,
    failures: u32,
    last_failure: Option<String>,
    metadata: BTreeMap<String, String>,
    started_at: Instant,
}

impl RetryContext {
    pub(crate) fn new(description: impl Into<String>, metadata: BTreeMap<String, String>) -> Self {
        Self {
            description: description.into(),
            attempt: 0,
            failures: 0,
            last_failure: None,
            metadata,
            started_at: Instant::now(),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// 1-based number of the current (or last) attempt
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Failed attempts so far
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub(crate) fn begin_attempt(&mut self) {
        self.attempt += 1;
    }

    pub(crate) fn record_failure(&mut self, cause: String) {
        self.failures += 1;
        self.last_failure = Some(cause);
    }
}
