//! Failure handlers - terminal sinks for expired groups, failed
//! aggregations, late members and messages past their redelivery limit
//!
//! Provides:
//! - Structured log output for every report
//! - A bounded in-memory failure log with per-kind filtering and age cleanup
//! - A dead-letter channel adapter
//! - Fan-out to several handlers

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fg_common::{FailureKind, FailureReport};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::router_metrics;

/// Downstream sink invoked once per terminal failure.
///
/// The core does not inspect the outcome; handlers that can fail must deal
/// with it themselves.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn handle(&self, report: FailureReport);
}

/// Log, count, then hand a report to the handler
pub(crate) async fn report_failure(handler: &dyn FailureHandler, report: FailureReport) {
    warn!(
        kind = %report.kind,
        identity = %report.identity,
        reason = %report.reason,
        messages = report.messages.len(),
        "Terminal failure reported"
    );
    router_metrics::record_failure_report(report.kind);
    handler.handle(report).await;
}

/// Writes each report as a structured log line
#[derive(Debug, Default, Clone)]
pub struct LoggingFailureHandler;

#[async_trait]
impl FailureHandler for LoggingFailureHandler {
    async fn handle(&self, report: FailureReport) {
        let message_ids: Vec<&str> = report.messages.iter().map(|m| m.id.as_str()).collect();
        error!(
            report_id = %report.id,
            kind = %report.kind,
            identity = %report.identity,
            reason = %report.reason,
            delivery_count = ?report.delivery_count,
            message_ids = ?message_ids,
            "Failure handler received report"
        );
    }
}

/// Configuration for the failure log
#[derive(Debug, Clone)]
pub struct FailureLogConfig {
    /// Maximum number of reports to keep
    pub max_reports: usize,
    /// Reports older than this are dropped by `cleanup`
    pub max_age_hours: i64,
}

impl Default for FailureLogConfig {
    fn default() -> Self {
        Self {
            max_reports: 1000,
            max_age_hours: 24,
        }
    }
}

/// In-memory failure log for out-of-band inspection
pub struct FailureLog {
    reports: RwLock<HashMap<String, FailureReport>>,
    config: FailureLogConfig,
}

impl FailureLog {
    pub fn new(config: FailureLogConfig) -> Self {
        Self {
            reports: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Store a report, evicting the oldest tenth when at capacity
    pub fn record(&self, report: FailureReport) -> String {
        let id = report.id.clone();
        let mut reports = self.reports.write();

        if reports.len() >= self.config.max_reports {
            Self::evict_oldest(&mut reports);
        }

        debug!(id = %id, kind = %report.kind, "Recorded failure report");
        reports.insert(id.clone(), report);
        id
    }

    pub fn get(&self, id: &str) -> Option<FailureReport> {
        self.reports.read().get(id).cloned()
    }

    /// All reports, oldest first
    pub fn get_all(&self) -> Vec<FailureReport> {
        let mut all: Vec<_> = self.reports.read().values().cloned().collect();
        all.sort_by_key(|r| r.occurred_at);
        all
    }

    pub fn by_kind(&self, kind: FailureKind) -> Vec<FailureReport> {
        let mut matching: Vec<_> = self
            .reports
            .read()
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.occurred_at);
        matching
    }

    /// Reports concerning one correlation id or message identity
    pub fn for_identity(&self, identity: &str) -> Vec<FailureReport> {
        self.reports
            .read()
            .values()
            .filter(|r| r.identity == identity)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.reports.read().len()
    }

    pub fn count_by_kind(&self, kind: FailureKind) -> usize {
        self.reports.read().values().filter(|r| r.kind == kind).count()
    }

    pub fn remove(&self, id: &str) -> bool {
        self.reports.write().remove(id).is_some()
    }

    /// Drop reports older than the given age
    pub fn clear_older_than(&self, hours_old: i64) -> usize {
        let mut reports = self.reports.write();
        let threshold_minutes = hours_old * 60;
        let before = reports.len();

        reports.retain(|_, r| r.age_minutes() <= threshold_minutes);

        let removed = before - reports.len();
        if removed > 0 {
            info!(removed = removed, "Cleared old failure reports");
        }
        removed
    }

    /// Periodic cleanup
    pub fn cleanup(&self) -> usize {
        self.clear_older_than(self.config.max_age_hours)
    }

    fn evict_oldest(reports: &mut HashMap<String, FailureReport>) {
        let to_remove = (reports.len() / 10).max(1);

        let mut sorted: Vec<_> = reports.values().map(|r| (r.occurred_at, r.id.clone())).collect();
        sorted.sort();

        for (_, id) in sorted.into_iter().take(to_remove) {
            reports.remove(&id);
        }
    }
}

impl Default for FailureLog {
    fn default() -> Self {
        Self::new(FailureLogConfig::default())
    }
}

#[async_trait]
impl FailureHandler for FailureLog {
    async fn handle(&self, report: FailureReport) {
        self.record(report);
    }
}

/// Forwards reports into a dead-letter channel
#[derive(Clone)]
pub struct ChannelFailureHandler {
    tx: mpsc::Sender<FailureReport>,
}

impl ChannelFailureHandler {
    pub fn new(tx: mpsc::Sender<FailureReport>) -> Self {
        Self { tx }
    }

    /// Create a handler together with the receiving end of its channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<FailureReport>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FailureHandler for ChannelFailureHandler {
    async fn handle(&self, report: FailureReport) {
        if let Err(e) = self.tx.send(report).await {
            error!(
                report_id = %e.0.id,
                identity = %e.0.identity,
                "Dead-letter channel closed, failure report dropped"
            );
        }
    }
}

/// Hands every report to each inner handler in order
#[derive(Default, Clone)]
pub struct CompositeFailureHandler {
    handlers: Vec<Arc<dyn FailureHandler>>,
}

impl CompositeFailureHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: Arc<dyn FailureHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl FailureHandler for CompositeFailureHandler {
    async fn handle(&self, report: FailureReport) {
        for handler in &self.handlers {
            handler.handle(report.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use fg_common::Message;
    use serde_json::json;

    fn report(kind: FailureKind, identity: &str) -> FailureReport {
        FailureReport::new(kind, identity, "test", vec![Message::with_id("m", json!(1))])
    }

    #[tokio::test]
    async fn test_failure_log_records_and_filters() {
        let log = FailureLog::default();
        log.handle(report(FailureKind::GroupExpired, "g-1")).await;
        log.handle(report(FailureKind::MaxRedeliveryExceeded, "m-1")).await;
        log.handle(report(FailureKind::GroupExpired, "g-2")).await;

        assert_eq!(log.count(), 3);
        assert_eq!(log.count_by_kind(FailureKind::GroupExpired), 2);
        assert_eq!(log.by_kind(FailureKind::MaxRedeliveryExceeded)[0].identity, "m-1");
        assert_eq!(log.for_identity("g-2").len(), 1);
    }

    #[test]
    fn test_failure_log_capacity() {
        let log = FailureLog::new(FailureLogConfig {
            max_reports: 10,
            max_age_hours: 24,
        });

        for i in 0..15 {
            log.record(report(FailureKind::LateEvent, &format!("g-{}", i)));
        }
        assert!(log.count() <= 10);
        // Newest report always survives eviction
        assert_eq!(log.for_identity("g-14").len(), 1);
    }

    #[test]
    fn test_failure_log_age_cleanup() {
        let log = FailureLog::default();
        let mut old = report(FailureKind::Aggregation, "old");
        old.occurred_at = Utc::now() - ChronoDuration::hours(48);
        log.record(old);
        let fresh_id = log.record(report(FailureKind::Aggregation, "fresh"));

        assert_eq!(log.cleanup(), 1);
        assert!(log.get(&fresh_id).is_some());
        assert!(log.remove(&fresh_id));
        assert_eq!(log.count(), 0);
    }

    #[tokio::test]
    async fn test_channel_and_composite_handlers() {
        let (channel, mut rx) = ChannelFailureHandler::channel(4);
        let log = Arc::new(FailureLog::default());
        let composite = CompositeFailureHandler::new()
            .with(Arc::new(LoggingFailureHandler))
            .with(Arc::new(channel))
            .with(log.clone());
        assert_eq!(composite.len(), 3);

        composite.handle(report(FailureKind::GroupExpired, "g-1")).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.identity, "g-1");
        assert_eq!(log.count(), 1);
    }

    #[tokio::test]
    async fn test_closed_channel_does_not_panic() {
        let (channel, rx) = ChannelFailureHandler::channel(1);
        drop(rx);
        channel.handle(report(FailureKind::LateEvent, "g")).await;
    }
}
