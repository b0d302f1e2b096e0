use chrono::{DateTime, Utc};
use serde::Serialize;

/// Category membership document (PostgreSQL `metrics.categories`).
///
/// Primary Key: name
/// Population: rebuilt from the `categories` array of every coin.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Category {
    pub name: String,
    pub category_id: Option<String>,
    pub coins: Vec<String>,
    pub coins_count: i32,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Category {
    pub fn new(name: impl Into<String>, coins: Vec<String>) -> Self {
        Self {
            name: name.into(),
            category_id: None,
            coins_count: coins.len() as i32,
            coins,
            updated_at: None,
        }
    }
}
