//! Aggregator - reduces each completed correlation group to one message
//!
//! The aggregator owns the failure path for groups: expired groups, groups
//! containing a failed member, reducer errors and late members are all
//! reported to the failure handler, never dropped.

use std::sync::Arc;

use chrono::Utc;
use fg_common::{FailureKind, FailureReport, Message};
use tracing::{debug, info, warn};

use crate::correlation::{CorrelationGroupTracker, EventGroup, GroupStatus, TrackerConfig};
use crate::error::RouterError;
use crate::failure::{report_failure, FailureHandler};
use crate::reducer::{reducer_from_config, Reducer};
use crate::router_metrics;
use crate::Result;

/// One message produced from a complete group
#[derive(Debug, Clone)]
pub struct AggregationResult {
    pub correlation_id: String,
    /// Metadata of the member chosen by the reducer, carrying the reduced payload
    pub message: Message,
    pub member_count: usize,
}

pub struct Aggregator {
    tracker: Arc<CorrelationGroupTracker>,
    reducer: Arc<dyn Reducer>,
    failure_handler: Arc<dyn FailureHandler>,
}

impl Aggregator {
    pub fn new(
        tracker: Arc<CorrelationGroupTracker>,
        reducer: Arc<dyn Reducer>,
        failure_handler: Arc<dyn FailureHandler>,
    ) -> Self {
        Self {
            tracker,
            reducer,
            failure_handler,
        }
    }

    /// Build an aggregator with its own tracker from configuration
    pub fn from_config(
        config: &fg_config::AggregatorConfig,
        failure_handler: Arc<dyn FailureHandler>,
    ) -> Result<Self> {
        let reducer = reducer_from_config(config)?;
        let tracker = Arc::new(CorrelationGroupTracker::new(TrackerConfig::from(config)));
        Ok(Self::new(tracker, reducer, failure_handler))
    }

    pub fn tracker(&self) -> &Arc<CorrelationGroupTracker> {
        &self.tracker
    }

    pub fn reducer(&self) -> &dyn Reducer {
        self.reducer.as_ref()
    }

    /// Add a correlated member. Returns the aggregated message when this
    /// member completed its group, `None` while the group is still accumulating.
    pub async fn accept(&self, message: Message) -> Result<Option<AggregationResult>> {
        let incoming = message.clone();

        match self.tracker.add_event(message) {
            Ok(GroupStatus::Accumulating) => Ok(None),
            Ok(GroupStatus::Ready) => {
                let correlation_id = incoming.correlation_id().unwrap_or_default().to_string();
                match self.tracker.take_ready(&correlation_id) {
                    Some(group) => self.aggregate(group).await.map(Some),
                    None => Ok(None),
                }
            }
            Ok(GroupStatus::Expired) => {
                let correlation_id = incoming.correlation_id().unwrap_or_default().to_string();
                // The reaper may already have taken the group
                let received = match self.tracker.take_expired(&correlation_id) {
                    Some(group) => {
                        let received = group.len();
                        self.report_expired(group).await;
                        received
                    }
                    None => 0,
                };
                self.report_late(incoming).await;
                Err(RouterError::GroupExpired {
                    correlation_id,
                    received,
                })
            }
            Err(e @ RouterError::LateEvent { .. }) => {
                self.report_late(incoming).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Reduce a complete group. Any failed member, or a reducer error, fails
    /// the whole group and reports every member.
    pub async fn aggregate(&self, group: EventGroup) -> Result<AggregationResult> {
        let correlation_id = group.correlation_id().to_string();
        let started = group.created_at();

        if group.has_failures() {
            let reasons: Vec<String> = group
                .events()
                .iter()
                .filter_map(|m| m.failure.as_ref().map(|f| format!("{}: {}", m.id, f)))
                .collect();
            let reason = format!("failed member(s): {}", reasons.join("; "));
            return Err(self.fail_group(group, "failed_member", reason).await);
        }

        let reduction = match self.reducer.reduce(group.events()) {
            Ok(r) if r.source_index < group.len() => r,
            Ok(r) => {
                let reason = format!(
                    "reducer '{}' chose member {} of {}",
                    self.reducer.name(),
                    r.source_index,
                    group.len()
                );
                return Err(self.fail_group(group, "reducer", reason).await);
            }
            Err(reason) => return Err(self.fail_group(group, "reducer", reason).await),
        };

        let member_count = group.len();
        let mut events = group.into_events();
        let mut message = events.swap_remove(reduction.source_index);
        message.payload = reduction.payload;

        router_metrics::record_group_completed(member_count);
        if let Ok(elapsed) = (Utc::now() - started).to_std() {
            router_metrics::record_group_latency(elapsed);
        }
        debug!(
            correlation_id = %correlation_id,
            members = member_count,
            reducer = self.reducer.name(),
            source = %message.id,
            "Aggregated correlation group"
        );

        Ok(AggregationResult {
            correlation_id,
            message,
            member_count,
        })
    }

    /// Expire and report every group past its deadline
    pub async fn reap_expired(&self) -> usize {
        let mut reaped = 0;
        for correlation_id in self.tracker.expired_ids() {
            if let Some(group) = self.tracker.take_expired(&correlation_id) {
                self.report_expired(group).await;
                reaped += 1;
            }
        }

        let purged = self.tracker.purge_closed();
        router_metrics::set_open_groups(self.tracker.open_groups());

        if reaped > 0 || purged > 0 {
            info!(reaped = reaped, purged = purged, "Expiry sweep complete");
        }
        reaped
    }

    async fn fail_group(&self, group: EventGroup, label: &str, reason: String) -> RouterError {
        let correlation_id = group.correlation_id().to_string();
        warn!(correlation_id = %correlation_id, reason = %reason, "Aggregation failed");
        router_metrics::record_aggregation_failure(label);

        let report = FailureReport::new(
            FailureKind::Aggregation,
            correlation_id.clone(),
            reason.clone(),
            group.into_events(),
        );
        report_failure(self.failure_handler.as_ref(), report).await;

        RouterError::Aggregation {
            correlation_id,
            reason,
        }
    }

    async fn report_expired(&self, group: EventGroup) {
        let correlation_id = group.correlation_id().to_string();
        let expected = group
            .expected_size()
            .map_or_else(|| "unknown".to_string(), |s| s.to_string());
        let reason = format!(
            "group expired with {} of {} member(s)",
            group.len(),
            expected
        );
        router_metrics::record_group_expired();

        let report = FailureReport::new(
            FailureKind::GroupExpired,
            correlation_id,
            reason,
            group.into_events(),
        );
        report_failure(self.failure_handler.as_ref(), report).await;
    }

    async fn report_late(&self, message: Message) {
        router_metrics::record_late_event();
        let correlation_id = message.correlation_id().unwrap_or_default().to_string();
        let reason = format!("member {} arrived after its group was closed", message.id);
        let report = FailureReport::new(FailureKind::LateEvent, correlation_id, reason, vec![message]);
        report_failure(self.failure_handler.as_ref(), report).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::FailureLog;
    use crate::reducer::{Collect, MinimumBy};
    use serde_json::json;

    fn aggregator(log: Arc<FailureLog>) -> Aggregator {
        Aggregator::new(
            Arc::new(CorrelationGroupTracker::default()),
            Arc::new(MinimumBy::new("rate")),
            log,
        )
    }

    fn quote(id: &str, request: &str, rate: f64) -> Message {
        Message::with_id(id, json!({"rate": rate}))
            .correlated(request, Some(3))
            .property("bank", id)
    }

    #[tokio::test]
    async fn test_lowest_quote_carries_source_metadata() {
        let log = Arc::new(FailureLog::default());
        let aggregator = aggregator(log.clone());

        assert!(aggregator.accept(quote("bank-a", "req", 5.5)).await.unwrap().is_none());
        assert!(aggregator.accept(quote("bank-b", "req", 4.25)).await.unwrap().is_none());
        let result = aggregator.accept(quote("bank-c", "req", 6.0)).await.unwrap().unwrap();

        assert_eq!(result.correlation_id, "req");
        assert_eq!(result.member_count, 3);
        assert_eq!(result.message.id, "bank-b");
        assert_eq!(result.message.properties["bank"], "bank-b");
        assert_eq!(result.message.payload["rate"], 4.25);
        assert_eq!(log.count(), 0);
    }

    #[tokio::test]
    async fn test_failed_member_fails_whole_group() {
        let log = Arc::new(FailureLog::default());
        let aggregator = aggregator(log.clone());

        aggregator.accept(quote("a", "req", 1.0)).await.unwrap();
        aggregator.accept(quote("b", "req", 2.0).failed("bank timeout")).await.unwrap();
        let result = aggregator.accept(quote("c", "req", 3.0)).await;

        assert!(matches!(result, Err(RouterError::Aggregation { .. })));
        let reports = log.by_kind(FailureKind::Aggregation);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].messages.len(), 3);
        assert!(reports[0].reason.contains("bank timeout"));
    }

    #[tokio::test]
    async fn test_reducer_error_is_reported() {
        let log = Arc::new(FailureLog::default());
        let aggregator = aggregator(log.clone());

        let result = aggregator
            .accept(Message::with_id("x", json!({"price": 1})).correlated("req", Some(1)))
            .await;

        assert!(matches!(result, Err(RouterError::Aggregation { .. })));
        assert_eq!(log.count_by_kind(FailureKind::Aggregation), 1);
    }

    #[tokio::test]
    async fn test_late_member_is_reported() {
        let log = Arc::new(FailureLog::default());
        let aggregator = Aggregator::new(
            Arc::new(CorrelationGroupTracker::default()),
            Arc::new(Collect),
            log.clone(),
        );

        let solo = Message::with_id("a", json!(1)).correlated("req", Some(1));
        let result = aggregator.accept(solo.clone()).await.unwrap().unwrap();
        assert_eq!(result.message.payload, json!([1]));

        let late = aggregator.accept(Message::with_id("b", json!(2)).correlated("req", Some(1))).await;
        assert!(matches!(late, Err(RouterError::LateEvent { .. })));
        assert_eq!(log.by_kind(FailureKind::LateEvent)[0].messages[0].id, "b");
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = fg_config::AggregatorConfig::default();
        let aggregator = Aggregator::from_config(&config, Arc::new(FailureLog::default())).unwrap();
        assert_eq!(aggregator.reducer().name(), "minimum");
        assert_eq!(aggregator.tracker().config().group_timeout, config.group_timeout());
    }
}
