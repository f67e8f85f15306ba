use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;

// ============================================================================
// Core Message Types
// ============================================================================

/// A message flowing through the routing core.
///
/// Correlation fields are set by whatever component split a request into
/// members; the tracker only reads them. A message with `failure` set is the
/// result of an upstream processing error and poisons its whole group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Declared number of members in the correlation group, if known
    #[serde(default)]
    pub correlation_group_size: Option<u32>,
    /// 1-based position of this member within its group
    #[serde(default)]
    pub correlation_sequence: Option<u32>,
    /// Marks the final member of a group whose size was never declared
    #[serde(default)]
    pub last_in_group: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub failure: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a message with a fresh random id
    pub fn new(payload: serde_json::Value) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), payload)
    }

    pub fn with_id(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            correlation_id: None,
            correlation_group_size: None,
            correlation_sequence: None,
            last_in_group: false,
            payload,
            properties: BTreeMap::new(),
            failure: None,
            created_at: Utc::now(),
        }
    }

    pub fn correlated(mut self, correlation_id: impl Into<String>, group_size: Option<u32>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self.correlation_group_size = group_size;
        self
    }

    pub fn sequence(mut self, sequence: u32) -> Self {
        self.correlation_sequence = Some(sequence);
        self
    }

    pub fn last(mut self) -> Self {
        self.last_in_group = true;
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

// ============================================================================
// Failure Reporting Types
// ============================================================================

/// Why a message or group was handed to the failure handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Group was not completed before its deadline
    GroupExpired,
    /// A member of a ready group carried an upstream failure, or the reducer failed
    Aggregation,
    /// Delivery count of a message identity passed the configured maximum
    MaxRedeliveryExceeded,
    /// Member arrived for a group that was already aggregated or reaped
    LateEvent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::GroupExpired => "group_expired",
            FailureKind::Aggregation => "aggregation",
            FailureKind::MaxRedeliveryExceeded => "max_redelivery_exceeded",
            FailureKind::LateEvent => "late_event",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure handed to a failure handler.
///
/// `identity` is the correlation id for group failures and the resolved
/// message identity for redelivery failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub id: String,
    pub kind: FailureKind,
    pub identity: String,
    pub reason: String,
    pub messages: Vec<Message>,
    pub delivery_count: Option<u32>,
    pub occurred_at: DateTime<Utc>,
}

impl FailureReport {
    pub fn new(
        kind: FailureKind,
        identity: impl Into<String>,
        reason: impl Into<String>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            identity: identity.into(),
            reason: reason.into(),
            messages,
            delivery_count: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_delivery_count(mut self, count: u32) -> Self {
        self.delivery_count = Some(count);
        self
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.occurred_at).num_minutes()
    }
}
