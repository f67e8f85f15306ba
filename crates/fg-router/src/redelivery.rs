//! Redelivery policy - per-identity delivery counting
//!
//! Each inbound message is resolved to an identity and its delivery record
//! is incremented in the object store with compare-and-swap, so concurrent
//! redeliveries of one identity never observe the same count. Deliveries
//! beyond the configured maximum are handed to the failure handler instead
//! of the main chain. Because the record lives in the injected store, a
//! file-backed store keeps counting across restarts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fg_common::{FailureKind, FailureReport, Message};
use fg_store::{FileObjectStore, MemoryObjectStore, MemoryStoreConfig, ObjectStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::RouterError;
use crate::failure::{report_failure, FailureHandler};
use crate::identity::{IdentityExpression, IdentityResolver, PayloadHashResolver};
use crate::router_metrics;
use crate::Result;

/// Stored per message identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub delivery_count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Outcome of admitting a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Continue to the main chain. A `delivery_count` of 0 means the message
    /// is untracked because its identity could not be resolved.
    Process { identity: String, delivery_count: u32 },
    /// Delivery count passed the maximum; the failure handler has already run
    RejectMaxRedelivery { identity: String, delivery_count: u32 },
}

impl Decision {
    pub fn is_process(&self) -> bool {
        matches!(self, Decision::Process { .. })
    }

    pub fn identity(&self) -> &str {
        match self {
            Decision::Process { identity, .. } | Decision::RejectMaxRedelivery { identity, .. } => identity,
        }
    }

    pub fn delivery_count(&self) -> u32 {
        match self {
            Decision::Process { delivery_count, .. }
            | Decision::RejectMaxRedelivery { delivery_count, .. } => *delivery_count,
        }
    }
}

/// What to do with a message whose identity cannot be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnresolvedIdentity {
    /// Fail closed: `admit` returns `RouterError::UnresolvedIdentity`
    #[default]
    Reject,
    /// Fail open: process without recording a delivery
    Process,
}

#[derive(Debug, Clone)]
pub struct RedeliveryPolicyConfig {
    pub max_redelivery_count: u32,
    /// Remove the record once the failure handler has seen a rejected message
    pub clear_on_reject: bool,
    pub unresolved_identity: UnresolvedIdentity,
}

impl Default for RedeliveryPolicyConfig {
    fn default() -> Self {
        Self {
            max_redelivery_count: 5,
            clear_on_reject: true,
            unresolved_identity: UnresolvedIdentity::Reject,
        }
    }
}

impl From<&fg_config::RedeliveryConfig> for RedeliveryPolicyConfig {
    fn from(config: &fg_config::RedeliveryConfig) -> Self {
        Self {
            max_redelivery_count: config.max_redelivery_count,
            clear_on_reject: config.clear_on_reject,
            unresolved_identity: if config.reject_unresolved_identity {
                UnresolvedIdentity::Reject
            } else {
                UnresolvedIdentity::Process
            },
        }
    }
}

pub struct RedeliveryPolicy {
    store: Arc<dyn ObjectStore>,
    resolver: Arc<dyn IdentityResolver>,
    failure_handler: Arc<dyn FailureHandler>,
    config: RedeliveryPolicyConfig,
}

impl RedeliveryPolicy {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        resolver: Arc<dyn IdentityResolver>,
        failure_handler: Arc<dyn FailureHandler>,
        config: RedeliveryPolicyConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            failure_handler,
            config,
        }
    }

    /// Build a policy from configuration around an already opened store
    pub fn from_config(
        config: &fg_config::RedeliveryConfig,
        store: Arc<dyn ObjectStore>,
        failure_handler: Arc<dyn FailureHandler>,
    ) -> Result<Self> {
        let resolver: Arc<dyn IdentityResolver> = if config.use_secure_hash {
            Arc::new(PayloadHashResolver)
        } else {
            Arc::new(IdentityExpression::parse(&config.id_expression)?)
        };

        info!(
            store = store.name(),
            id_expression = resolver.describe(),
            max_redelivery_count = config.max_redelivery_count,
            "Redelivery policy configured"
        );

        Ok(Self::new(store, resolver, failure_handler, RedeliveryPolicyConfig::from(config)))
    }

    /// The identity expression as configured
    pub fn id_expression(&self) -> &str {
        self.resolver.describe()
    }

    pub fn config(&self) -> &RedeliveryPolicyConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Count this delivery and decide whether the message may proceed
    pub async fn admit(&self, message: &Message) -> Result<Decision> {
        let identity = match self.resolver.resolve(message) {
            Some(identity) => identity,
            None => return self.unresolved(message),
        };

        let record = self.increment(&identity).await?;
        let delivery_count = record.delivery_count;

        if delivery_count > self.config.max_redelivery_count {
            self.reject(message, &identity, delivery_count).await?;
            return Ok(Decision::RejectMaxRedelivery {
                identity,
                delivery_count,
            });
        }

        debug!(identity = %identity, delivery_count = delivery_count, "Message admitted");
        router_metrics::record_redelivery_decision("process");
        Ok(Decision::Process {
            identity,
            delivery_count,
        })
    }

    /// Downstream processing succeeded: forget the identity
    pub async fn on_success(&self, message: &Message) -> Result<()> {
        if let Some(identity) = self.resolver.resolve(message) {
            if self.store.remove(&identity).await?.is_some() {
                debug!(identity = %identity, "Delivery record cleared");
            }
        }
        Ok(())
    }

    /// Downstream processing failed: keep the record so the next delivery counts on
    pub async fn on_failure(&self, message: &Message, reason: &str) -> Result<()> {
        if let Some(identity) = self.resolver.resolve(message) {
            let record = self.delivery_record(&identity).await?;
            warn!(
                identity = %identity,
                delivery_count = record.map(|r| r.delivery_count).unwrap_or(0),
                max = self.config.max_redelivery_count,
                reason = %reason,
                "Message processing failed, awaiting redelivery"
            );
        }
        Ok(())
    }

    /// Admit, run `handler`, then signal success or failure.
    ///
    /// A store error while signalling is logged and counted but does not
    /// replace the handler's result.
    ///
    /// Rejected messages return `RouterError::MaxRedeliveryExceeded` after the
    /// failure handler ran; handler errors return `RouterError::Processing`.
    pub async fn process<F, Fut, T, E>(&self, message: Message, handler: F) -> Result<T>
    where
        F: FnOnce(Message) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let decision = self.admit(&message).await?;
        let identity = match decision {
            Decision::Process { identity, .. } => identity,
            Decision::RejectMaxRedelivery {
                identity,
                delivery_count,
            } => {
                return Err(RouterError::MaxRedeliveryExceeded {
                    identity,
                    delivery_count,
                    max: self.config.max_redelivery_count,
                })
            }
        };

        // The handler's outcome stands even if the record cannot be updated
        let retained = message.clone();
        match handler(message).await {
            Ok(value) => {
                if let Err(e) = self.on_success(&retained).await {
                    warn!(identity = %identity, error = %e, "Processed message but could not clear its delivery record");
                    router_metrics::record_delivery_record_error("clear");
                }
                Ok(value)
            }
            Err(e) => {
                let reason = e.to_string();
                if let Err(store_err) = self.on_failure(&retained, &reason).await {
                    warn!(identity = %identity, error = %store_err, "Could not read delivery record after failure");
                    router_metrics::record_delivery_record_error("read");
                }
                Err(RouterError::Processing { identity, reason })
            }
        }
    }

    /// Current record for an identity, for out-of-band inspection
    pub async fn delivery_record(&self, identity: &str) -> Result<Option<DeliveryRecord>> {
        match self.store.get(identity).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn increment(&self, identity: &str) -> Result<DeliveryRecord> {
        loop {
            let current = self.store.get(identity).await?;
            let now = Utc::now();

            let next = match &current {
                Some(value) => {
                    let mut record: DeliveryRecord = serde_json::from_value(value.clone())?;
                    record.delivery_count = record.delivery_count.saturating_add(1);
                    record.last_seen = now;
                    record
                }
                None => DeliveryRecord {
                    delivery_count: 1,
                    first_seen: now,
                    last_seen: now,
                },
            };

            let swapped = self
                .store
                .compare_and_swap(identity, current.as_ref(), Some(serde_json::to_value(&next)?))
                .await?;
            if swapped {
                return Ok(next);
            }
            debug!(identity = %identity, "Delivery record changed concurrently, retrying increment");
        }
    }

    async fn reject(&self, message: &Message, identity: &str, delivery_count: u32) -> Result<()> {
        let max = self.config.max_redelivery_count;
        warn!(
            identity = %identity,
            message_id = %message.id,
            delivery_count = delivery_count,
            max = max,
            "Max redelivery count exceeded, routing to failure handler"
        );
        router_metrics::record_redelivery_decision("reject");

        let report = FailureReport::new(
            FailureKind::MaxRedeliveryExceeded,
            identity,
            format!("delivery {} exceeds max redelivery count {}", delivery_count, max),
            vec![message.clone()],
        )
        .with_delivery_count(delivery_count);
        report_failure(self.failure_handler.as_ref(), report).await;

        if self.config.clear_on_reject {
            self.store.remove(identity).await?;
        }
        Ok(())
    }

    fn unresolved(&self, message: &Message) -> Result<Decision> {
        match self.config.unresolved_identity {
            UnresolvedIdentity::Reject => {
                warn!(
                    message_id = %message.id,
                    expression = self.resolver.describe(),
                    "Message identity cannot be resolved, rejecting"
                );
                router_metrics::record_redelivery_decision("unresolved");
                Err(RouterError::UnresolvedIdentity {
                    message_id: message.id.clone(),
                    expression: self.resolver.describe().to_string(),
                })
            }
            UnresolvedIdentity::Process => {
                debug!(
                    message_id = %message.id,
                    expression = self.resolver.describe(),
                    "Message identity cannot be resolved, processing untracked"
                );
                router_metrics::record_redelivery_decision("untracked");
                Ok(Decision::Process {
                    identity: message.id.clone(),
                    delivery_count: 0,
                })
            }
        }
    }
}

/// Open the configured object store
pub async fn object_store_from_config(
    config: &fg_config::ObjectStoreConfig,
) -> Result<Arc<dyn ObjectStore>> {
    match config.store_type.to_ascii_lowercase().as_str() {
        "memory" => {
            let limits = MemoryStoreConfig {
                max_entries: config.max_entries,
                entry_ttl: config.entry_ttl_secs.map(Duration::from_secs),
            };
            Ok(Arc::new(MemoryObjectStore::with_config(config.name.clone(), limits)))
        }
        "file" => {
            let store = FileObjectStore::open(config.name.clone(), config.path.clone()).await?;
            Ok(Arc::new(store))
        }
        other => Err(RouterError::Config(format!("unknown object store type '{}'", other))),
    }
}
