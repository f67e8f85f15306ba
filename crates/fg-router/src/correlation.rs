//! Correlation group tracking
//!
//! Each correlation id maps to a slot that is either an open group or a
//! closed marker. Open groups are guarded by their own mutex so unrelated
//! groups never contend; the map itself is only locked long enough to look up
//! or swap a slot. A group leaves the open state exactly once, through
//! `take_ready` or `take_expired`, and its id then keeps rejecting members
//! until the closed marker is purged.
//!
//! Lock order: a map guard is never held while waiting on a group mutex.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fg_common::Message;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::RouterError;
use crate::router_metrics;
use crate::Result;

/// Outcome of adding a member to its group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// Waiting for more members
    Accumulating,
    /// Complete and waiting to be taken for aggregation
    Ready,
    /// Deadline passed before completion; the offered member was not merged
    Expired,
}

/// Why a correlation id was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Aggregated,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Accumulating,
    Ready,
    Closed,
}

/// Members collected so far for one correlation id
#[derive(Debug)]
pub struct EventGroup {
    correlation_id: String,
    expected_size: Option<usize>,
    promised_size: Option<usize>,
    events: Vec<Message>,
    created_at: DateTime<Utc>,
    deadline: Instant,
    state: GroupState,
}

impl EventGroup {
    fn new(correlation_id: String, timeout: Duration) -> Self {
        Self {
            correlation_id,
            expected_size: None,
            promised_size: None,
            events: Vec::new(),
            created_at: Utc::now(),
            deadline: Instant::now() + timeout,
            state: GroupState::Accumulating,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Declared group size, if any member carried one
    pub fn expected_size(&self) -> Option<usize> {
        self.expected_size
    }

    /// Members in arrival order
    pub fn events(&self) -> &[Message] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Message> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn has_failures(&self) -> bool {
        self.events.iter().any(Message::is_failed)
    }

    fn accept(&mut self, message: Message) {
        if let Some(size) = message.correlation_group_size.filter(|s| *s > 0) {
            let size = size as usize;
            match self.expected_size {
                None => self.expected_size = Some(size),
                Some(existing) if existing != size => warn!(
                    correlation_id = %self.correlation_id,
                    message_id = %message.id,
                    declared = size,
                    kept = existing,
                    "Conflicting group size declaration ignored"
                ),
                Some(_) => {}
            }
        }

        if message.last_in_group {
            // Without a sequence number the marker promises only what has arrived
            let promised = message
                .correlation_sequence
                .map(|s| s as usize)
                .unwrap_or(self.events.len() + 1);
            self.promised_size = Some(self.promised_size.map_or(promised, |p| p.max(promised)));
        }

        self.events.push(message);
    }

    fn is_complete(&self) -> bool {
        let received = self.events.len();
        if self.expected_size.is_some_and(|expected| received >= expected) {
            return true;
        }
        self.promised_size.is_some_and(|promised| received >= promised)
    }

    fn is_overdue(&self, now: Instant) -> bool {
        self.state == GroupState::Accumulating && now >= self.deadline
    }

    /// Move the members out, leaving a closed shell behind
    fn close(&mut self) -> EventGroup {
        self.state = GroupState::Closed;
        EventGroup {
            correlation_id: self.correlation_id.clone(),
            expected_size: self.expected_size,
            promised_size: self.promised_size,
            events: std::mem::take(&mut self.events),
            created_at: self.created_at,
            deadline: self.deadline,
            state: GroupState::Closed,
        }
    }
}

enum Slot {
    Open(Arc<Mutex<EventGroup>>),
    Closed { reason: CloseReason, closed_at: Instant },
}

/// Tracker timing configuration
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Time a group may stay incomplete
    pub group_timeout: Duration,
    /// How long a closed id keeps rejecting late members
    pub closed_group_retention: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            group_timeout: Duration::from_secs(60),
            closed_group_retention: Duration::from_secs(300),
        }
    }
}

impl From<&fg_config::AggregatorConfig> for TrackerConfig {
    fn from(config: &fg_config::AggregatorConfig) -> Self {
        Self {
            group_timeout: config.group_timeout(),
            closed_group_retention: config.closed_group_retention(),
        }
    }
}

pub struct CorrelationGroupTracker {
    config: TrackerConfig,
    groups: DashMap<String, Slot>,
}

impl CorrelationGroupTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            groups: DashMap::new(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Add a member to its group, creating the group on first sight.
    ///
    /// Members for a closed id, or surplus members for a group that is
    /// already complete, are rejected with `RouterError::LateEvent`.
    pub fn add_event(&self, message: Message) -> Result<GroupStatus> {
        let correlation_id = match message.correlation_id() {
            Some(id) => id.to_string(),
            None => {
                return Err(RouterError::MissingCorrelationId {
                    message_id: message.id,
                })
            }
        };

        let group = {
            let mut created = false;
            let slot = self.groups.entry(correlation_id.clone()).or_insert_with(|| {
                created = true;
                Slot::Open(Arc::new(Mutex::new(EventGroup::new(
                    correlation_id.clone(),
                    self.config.group_timeout,
                ))))
            });

            match slot.value() {
                Slot::Open(group) => {
                    if created {
                        debug!(correlation_id = %correlation_id, "Opened correlation group");
                        router_metrics::record_group_opened();
                    }
                    Arc::clone(group)
                }
                Slot::Closed { reason, .. } => {
                    debug!(
                        correlation_id = %correlation_id,
                        message_id = %message.id,
                        reason = ?reason,
                        "Member arrived for closed group"
                    );
                    return Err(RouterError::LateEvent {
                        correlation_id,
                        message_id: message.id,
                    });
                }
            }
        };

        let mut group = group.lock();
        match group.state {
            GroupState::Accumulating => {}
            GroupState::Ready | GroupState::Closed => {
                return Err(RouterError::LateEvent {
                    correlation_id,
                    message_id: message.id,
                });
            }
        }

        if group.is_overdue(Instant::now()) {
            return Ok(GroupStatus::Expired);
        }

        group.accept(message);

        if group.is_complete() {
            group.state = GroupState::Ready;
            debug!(
                correlation_id = %correlation_id,
                members = group.len(),
                "Correlation group complete"
            );
            Ok(GroupStatus::Ready)
        } else {
            Ok(GroupStatus::Accumulating)
        }
    }

    /// Take a ready group out of the tracker. Returns `None` unless the group
    /// is ready, so each group is handed out at most once.
    pub fn take_ready(&self, correlation_id: &str) -> Option<EventGroup> {
        let group = self.open_group(correlation_id)?;
        let taken = {
            let mut guard = group.lock();
            if guard.state != GroupState::Ready {
                return None;
            }
            guard.close()
        };

        self.mark_closed(correlation_id, &group, CloseReason::Aggregated);
        Some(taken)
    }

    /// Take a group whose deadline passed before it completed
    pub fn take_expired(&self, correlation_id: &str) -> Option<EventGroup> {
        let group = self.open_group(correlation_id)?;
        let taken = {
            let mut guard = group.lock();
            if !guard.is_overdue(Instant::now()) {
                return None;
            }
            guard.close()
        };

        self.mark_closed(correlation_id, &group, CloseReason::Expired);
        Some(taken)
    }

    /// Ids of open groups past their deadline
    pub fn expired_ids(&self) -> Vec<String> {
        let now = Instant::now();
        self.open_groups_snapshot()
            .into_iter()
            .filter(|(_, group)| group.lock().is_overdue(now))
            .map(|(id, _)| id)
            .collect()
    }

    /// Drop closed markers older than the retention window
    pub fn purge_closed(&self) -> usize {
        let retention = self.config.closed_group_retention;
        let mut purged = 0;
        self.groups.retain(|_, slot| match slot {
            Slot::Closed { closed_at, .. } if closed_at.elapsed() >= retention => {
                purged += 1;
                false
            }
            _ => true,
        });
        purged
    }

    /// Current status of an open group, `None` for unknown or closed ids
    pub fn status(&self, correlation_id: &str) -> Option<GroupStatus> {
        let group = self.open_group(correlation_id)?;
        let guard = group.lock();
        match guard.state {
            GroupState::Ready => Some(GroupStatus::Ready),
            GroupState::Closed => None,
            GroupState::Accumulating if guard.is_overdue(Instant::now()) => Some(GroupStatus::Expired),
            GroupState::Accumulating => Some(GroupStatus::Accumulating),
        }
    }

    pub fn closed_reason(&self, correlation_id: &str) -> Option<CloseReason> {
        self.groups.get(correlation_id).and_then(|slot| match slot.value() {
            Slot::Closed { reason, .. } => Some(*reason),
            Slot::Open(_) => None,
        })
    }

    pub fn open_groups(&self) -> usize {
        self.groups
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Open(_)))
            .count()
    }

    fn open_group(&self, correlation_id: &str) -> Option<Arc<Mutex<EventGroup>>> {
        let slot = self.groups.get(correlation_id)?;
        match slot.value() {
            Slot::Open(group) => Some(Arc::clone(group)),
            Slot::Closed { .. } => None,
        }
    }

    fn open_groups_snapshot(&self) -> Vec<(String, Arc<Mutex<EventGroup>>)> {
        self.groups
            .iter()
            .filter_map(|slot| match slot.value() {
                Slot::Open(group) => Some((slot.key().clone(), Arc::clone(group))),
                Slot::Closed { .. } => None,
            })
            .collect()
    }

    fn mark_closed(&self, correlation_id: &str, group: &Arc<Mutex<EventGroup>>, reason: CloseReason) {
        if let Some(mut slot) = self.groups.get_mut(correlation_id) {
            let same_group = matches!(slot.value(), Slot::Open(current) if Arc::ptr_eq(current, group));
            if same_group {
                *slot = Slot::Closed {
                    reason,
                    closed_at: Instant::now(),
                };
            }
        }
    }
}

impl Default for CorrelationGroupTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member(id: &str, correlation_id: &str, size: Option<u32>) -> Message {
        Message::with_id(id, json!({})).correlated(correlation_id, size)
    }

    #[test]
    fn test_declared_size_completes_group() {
        let tracker = CorrelationGroupTracker::default();

        assert_eq!(tracker.add_event(member("a", "g", Some(2))).unwrap(), GroupStatus::Accumulating);
        assert_eq!(tracker.add_event(member("b", "g", Some(2))).unwrap(), GroupStatus::Ready);
        assert_eq!(tracker.status("g"), Some(GroupStatus::Ready));

        let group = tracker.take_ready("g").unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group.events()[0].id, "a");
        assert!(tracker.take_ready("g").is_none());
        assert_eq!(tracker.closed_reason("g"), Some(CloseReason::Aggregated));
    }

    #[test]
    fn test_size_of_one_is_ready_immediately() {
        let tracker = CorrelationGroupTracker::default();
        assert_eq!(tracker.add_event(member("a", "solo", Some(1))).unwrap(), GroupStatus::Ready);
    }

    #[test]
    fn test_last_marker_waits_for_promised_members() {
        let tracker = CorrelationGroupTracker::default();

        let last = member("c", "g", None).sequence(3).last();
        assert_eq!(tracker.add_event(last).unwrap(), GroupStatus::Accumulating);
        assert_eq!(tracker.add_event(member("a", "g", None)).unwrap(), GroupStatus::Accumulating);
        assert_eq!(tracker.add_event(member("b", "g", None)).unwrap(), GroupStatus::Ready);
    }

    #[test]
    fn test_last_marker_without_sequence() {
        let tracker = CorrelationGroupTracker::default();

        assert_eq!(tracker.add_event(member("a", "g", None)).unwrap(), GroupStatus::Accumulating);
        assert_eq!(
            tracker.add_event(member("b", "g", None).last()).unwrap(),
            GroupStatus::Ready
        );
    }

    #[test]
    fn test_surplus_and_late_members_are_rejected() {
        let tracker = CorrelationGroupTracker::default();

        tracker.add_event(member("a", "g", Some(1))).unwrap();
        let surplus = tracker.add_event(member("b", "g", Some(1)));
        assert!(matches!(surplus, Err(RouterError::LateEvent { .. })));

        tracker.take_ready("g").unwrap();
        let late = tracker.add_event(member("c", "g", Some(1)));
        assert!(matches!(late, Err(RouterError::LateEvent { .. })));
        assert_eq!(tracker.open_groups(), 0);
    }

    #[test]
    fn test_missing_correlation_id() {
        let tracker = CorrelationGroupTracker::default();
        let result = tracker.add_event(Message::with_id("x", json!(null)));
        assert!(matches!(result, Err(RouterError::MissingCorrelationId { .. })));
    }

    #[test]
    fn test_conflicting_size_keeps_first_declaration() {
        let tracker = CorrelationGroupTracker::default();

        tracker.add_event(member("a", "g", Some(3))).unwrap();
        assert_eq!(tracker.add_event(member("b", "g", Some(2))).unwrap(), GroupStatus::Accumulating);
        assert_eq!(tracker.add_event(member("c", "g", Some(2))).unwrap(), GroupStatus::Ready);
    }

    #[test]
    fn test_purge_closed_respects_retention() {
        let tracker = CorrelationGroupTracker::new(TrackerConfig {
            group_timeout: Duration::from_secs(60),
            closed_group_retention: Duration::ZERO,
        });

        tracker.add_event(member("a", "g", Some(1))).unwrap();
        tracker.take_ready("g").unwrap();
        assert_eq!(tracker.purge_closed(), 1);
        assert_eq!(tracker.closed_reason("g"), None);

        // Once purged the id may be reused
        assert_eq!(tracker.add_event(member("b", "g", Some(1))).unwrap(), GroupStatus::Ready);
    }
}
