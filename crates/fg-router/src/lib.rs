//! Flowgate Message Router
//!
//! The routing core that sits between a message source and downstream
//! processing:
//! - CorrelationGroupTracker: per-correlation-id groups with completion and expiry
//! - Aggregator: reduces each completed group to a single result
//! - Reducer: pluggable reduction strategies (minimum, maximum, collect, closures)
//! - RedeliveryPolicy: per-identity delivery counting with a max-redelivery cutoff
//! - IdentityExpression: configurable message identity resolution
//! - FailureHandler: terminal sink for expired groups, failed aggregations and rejected messages
//! - Lifecycle: background expiry sweep

pub mod aggregator;
pub mod correlation;
pub mod error;
pub mod failure;
pub mod identity;
pub mod lifecycle;
pub mod router_metrics;
pub mod redelivery;
pub mod reducer;

pub use aggregator::{AggregationResult, Aggregator};
pub use correlation::{CloseReason, CorrelationGroupTracker, EventGroup, GroupStatus, TrackerConfig};
pub use error::RouterError;
pub use failure::{
    ChannelFailureHandler, CompositeFailureHandler, FailureHandler, FailureLog, FailureLogConfig,
    LoggingFailureHandler,
};
pub use identity::{IdentityExpression, IdentityResolver, PayloadHashResolver};
pub use lifecycle::spawn_group_reaper;
pub use redelivery::{
    object_store_from_config, Decision, DeliveryRecord, RedeliveryPolicy, RedeliveryPolicyConfig,
    UnresolvedIdentity,
};
pub use reducer::{reducer_from_config, Collect, FnReducer, MaximumBy, MinimumBy, Reducer, Reduction};

pub type Result<T> = std::result::Result<T, RouterError>;
