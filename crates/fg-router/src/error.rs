use fg_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Message {message_id} has no correlation id")]
    MissingCorrelationId { message_id: String },

    #[error("Correlation group {correlation_id} expired with {received} member(s)")]
    GroupExpired { correlation_id: String, received: usize },

    #[error("Aggregation failed for group {correlation_id}: {reason}")]
    Aggregation { correlation_id: String, reason: String },

    #[error("Late member {message_id} for closed correlation group {correlation_id}")]
    LateEvent { correlation_id: String, message_id: String },

    #[error("Message {identity} exceeded max redelivery count ({delivery_count} > {max})")]
    MaxRedeliveryExceeded { identity: String, delivery_count: u32, max: u32 },

    #[error("Cannot resolve identity of message {message_id} with {expression}")]
    UnresolvedIdentity { message_id: String, expression: String },

    #[error("Processing failed for {identity}: {reason}")]
    Processing { identity: String, reason: String },

    #[error("Invalid identity expression: {0}")]
    InvalidExpression(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Object store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
