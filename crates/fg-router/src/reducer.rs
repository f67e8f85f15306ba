//! Aggregation strategies
//!
//! A reducer turns the ordered members of a complete group into one payload
//! and names the member whose metadata the result inherits.

use std::sync::Arc;

use fg_common::Message;
use serde_json::Value;

use crate::error::RouterError;
use crate::Result;

/// Output of a reducer
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    /// Index of the member whose metadata the result carries
    pub source_index: usize,
    pub payload: Value,
}

pub trait Reducer: Send + Sync {
    fn name(&self) -> &str;

    /// Reduce members given in arrival order. An `Err` fails the whole group.
    fn reduce(&self, events: &[Message]) -> std::result::Result<Reduction, String>;
}

/// Read a numeric field: a plain key, or a JSON pointer when it starts with `/`
fn numeric_field(message: &Message, field: &str) -> std::result::Result<f64, String> {
    let value = if field.starts_with('/') {
        message.payload.pointer(field)
    } else {
        message.payload.get(field)
    };

    value
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("member {} has no numeric field '{}'", message.id, field))
}

fn select_by<F>(events: &[Message], field: &str, better: F) -> std::result::Result<Reduction, String>
where
    F: Fn(f64, f64) -> bool,
{
    let mut best: Option<(usize, f64)> = None;
    for (index, message) in events.iter().enumerate() {
        let value = numeric_field(message, field)?;
        // Strict comparison keeps the earliest arrival on ties
        match best {
            Some((_, current)) if !better(value, current) => {}
            _ => best = Some((index, value)),
        }
    }

    let (source_index, _) = best.ok_or_else(|| "cannot reduce an empty group".to_string())?;
    Ok(Reduction {
        source_index,
        payload: events[source_index].payload.clone(),
    })
}

/// Selects the member with the lowest numeric field
#[derive(Debug, Clone)]
pub struct MinimumBy {
    field: String,
}

impl MinimumBy {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }
}

impl Reducer for MinimumBy {
    fn name(&self) -> &str {
        "minimum"
    }

    fn reduce(&self, events: &[Message]) -> std::result::Result<Reduction, String> {
        select_by(events, &self.field, |candidate, current| candidate < current)
    }
}

/// Selects the member with the highest numeric field
#[derive(Debug, Clone)]
pub struct MaximumBy {
    field: String,
}

impl MaximumBy {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }
}

impl Reducer for MaximumBy {
    fn name(&self) -> &str {
        "maximum"
    }

    fn reduce(&self, events: &[Message]) -> std::result::Result<Reduction, String> {
        select_by(events, &self.field, |candidate, current| candidate > current)
    }
}

/// Concatenates member payloads into an array, inheriting the first member's metadata
#[derive(Debug, Clone, Default)]
pub struct Collect;

impl Reducer for Collect {
    fn name(&self) -> &str {
        "collect"
    }

    fn reduce(&self, events: &[Message]) -> std::result::Result<Reduction, String> {
        if events.is_empty() {
            return Err("cannot reduce an empty group".to_string());
        }
        Ok(Reduction {
            source_index: 0,
            payload: Value::Array(events.iter().map(|m| m.payload.clone()).collect()),
        })
    }
}

/// Adapts a closure into a reducer
pub struct FnReducer<F> {
    name: String,
    f: F,
}

impl<F> FnReducer<F>
where
    F: Fn(&[Message]) -> std::result::Result<Reduction, String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> Reducer for FnReducer<F>
where
    F: Fn(&[Message]) -> std::result::Result<Reduction, String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn reduce(&self, events: &[Message]) -> std::result::Result<Reduction, String> {
        (self.f)(events)
    }
}

/// Build the configured reducer
pub fn reducer_from_config(config: &fg_config::AggregatorConfig) -> Result<Arc<dyn Reducer>> {
    match config.reducer.to_ascii_lowercase().as_str() {
        "minimum" => Ok(Arc::new(MinimumBy::new(config.reducer_field.clone()))),
        "maximum" => Ok(Arc::new(MaximumBy::new(config.reducer_field.clone()))),
        "collect" => Ok(Arc::new(Collect)),
        other => Err(RouterError::Config(format!("unknown reducer '{}'", other))),
    }
}
