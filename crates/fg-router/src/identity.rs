//! Message identity resolution for redelivery tracking
//!
//! Expressions use the `#[...]` form, optionally prefixed with `mel:`:
//!
//! | Expression | Identity |
//! |------------|----------|
//! | `#[message:id]` | message id |
//! | `#[message:correlationId]` | correlation id |
//! | `#[property:NAME]`, `#[header:NAME]` | message property |
//! | `#[payload:sha256]` | hex SHA-256 of the JSON payload |

use fg_common::Message;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::RouterError;
use crate::Result;

/// Derives the identity under which deliveries of a message are counted.
///
/// `None` means the identity cannot be resolved for this message. An
/// expression that yields different values for redeliveries of the same
/// logical message cannot be detected here.
pub trait IdentityResolver: Send + Sync {
    /// Human readable form, used in logs and errors
    fn describe(&self) -> &str;

    fn resolve(&self, message: &Message) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    MessageId,
    CorrelationId,
    Property(String),
    PayloadHash,
}

/// Parsed identity expression. The original text is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityExpression {
    source_text: String,
    source: Source,
}

impl IdentityExpression {
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = || RouterError::InvalidExpression(expression.to_string());

        let inner = expression
            .trim()
            .strip_prefix("#[")
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(invalid)?
            .trim();
        let inner = inner.strip_prefix("mel:").unwrap_or(inner);

        let (scope, name) = inner
            .split_once(':')
            .or_else(|| inner.split_once('.'))
            .ok_or_else(invalid)?;

        let source = match (scope.trim(), name.trim()) {
            ("message", "id") => Source::MessageId,
            ("message", "correlationId") => Source::CorrelationId,
            ("property" | "header", name) if !name.is_empty() => Source::Property(name.to_string()),
            ("payload", "sha256") => Source::PayloadHash,
            _ => return Err(invalid()),
        };

        Ok(Self {
            source_text: expression.to_string(),
            source,
        })
    }

    /// The expression exactly as configured
    pub fn source(&self) -> &str {
        &self.source_text
    }
}

impl IdentityResolver for IdentityExpression {
    fn describe(&self) -> &str {
        &self.source_text
    }

    fn resolve(&self, message: &Message) -> Option<String> {
        let identity = match &self.source {
            Source::MessageId => Some(message.id.clone()),
            Source::CorrelationId => message.correlation_id().map(str::to_string),
            Source::Property(name) => message.properties.get(name).cloned(),
            Source::PayloadHash => Some(payload_sha256(message)),
        };
        identity.filter(|id| !id.is_empty())
    }
}

/// Identifies messages by the content of their payload
#[derive(Debug, Clone, Default)]
pub struct PayloadHashResolver;

impl IdentityResolver for PayloadHashResolver {
    fn describe(&self) -> &str {
        "#[payload:sha256]"
    }

    fn resolve(&self, message: &Message) -> Option<String> {
        Some(payload_sha256(message))
    }
}

fn payload_sha256(message: &Message) -> String {
    let bytes = canonical(&message.payload).to_string();
    hex::encode(Sha256::digest(bytes.as_bytes()))
}

/// Rebuild a value with object keys sorted at every level, independent of
/// whether the map type preserves insertion order
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.clone(), canonical(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}
