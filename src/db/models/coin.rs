use serde_json::{Map, Value};

/// Which part of a coin document an update writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateTarget {
    /// Replaces `stats.change` (performance and rank changes)
    StatsChange,
    /// Replaces `category_ranks`
    CategoryRanks,
}

/// Idempotent "set these fields on coin X, creating it if absent" operation
/// against the coin registry (`metrics.coins`, primary key `coin_id`).
///
/// Applying the same update twice leaves the document unchanged the second
/// time, and the registry reports zero modified rows for it.
#[derive(Debug, Clone, PartialEq)]
pub struct CoinUpdate {
    pub coin_id: String,
    pub target: UpdateTarget,
    pub fields: Map<String, Value>,
}

impl CoinUpdate {
    pub fn new(coin_id: impl Into<String>, target: UpdateTarget) -> Self {
        Self {
            coin_id: coin_id.into(),
            target,
            fields: Map::new(),
        }
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Fields as a JSON object, the form bound into the upsert statement.
    pub fn fields_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}
