//! Metrics for the routing core
//!
//! Prometheus-compatible counters and gauges for:
//! - Correlation group lifecycle
//! - Aggregation outcomes
//! - Redelivery decisions
//! - Failure reports

use fg_common::FailureKind;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a new correlation group being opened
pub fn record_group_opened() {
    counter!("fg_groups_opened_total").increment(1);
}

/// Record a group reduced to a single result
pub fn record_group_completed(members: usize) {
    counter!("fg_groups_completed_total").increment(1);
    histogram!("fg_group_members").record(members as f64);
}

/// Record a group that missed its deadline
pub fn record_group_expired() {
    counter!("fg_groups_expired_total").increment(1);
}

/// Record a group that could not be reduced
pub fn record_aggregation_failure(reason: &str) {
    counter!(
        "fg_aggregation_failures_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a member arriving for a closed group
pub fn record_late_event() {
    counter!("fg_late_events_total").increment(1);
}

/// Record a redelivery admission decision
pub fn record_redelivery_decision(decision: &str) {
    counter!(
        "fg_redelivery_decisions_total",
        "decision" => decision.to_string()
    )
    .increment(1);
}

/// Record a delivery record that could not be updated after processing
pub fn record_delivery_record_error(operation: &str) {
    counter!(
        "fg_delivery_record_errors_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a report handed to the failure handler
pub fn record_failure_report(kind: FailureKind) {
    counter!(
        "fg_failure_reports_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Update the open group gauge
pub fn set_open_groups(count: usize) {
    gauge!("fg_groups_open").set(count as f64);
}

/// Record time from group creation to aggregation
pub fn record_group_latency(duration: Duration) {
    histogram!("fg_group_duration_seconds").record(duration.as_secs_f64());
}
