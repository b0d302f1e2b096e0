use chrono::{DateTime, NaiveDate, Utc};
use clickhouse::Row;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::utils::{chrono_to_offset, date_to_naive, offset_to_chrono};

/// One observation of a coin (ClickHouse `coin_snapshots`).
///
/// Table engine is `ReplacingMergeTree(updated_at)` ordered by
/// `(coin_id, timestamp)`, so writing the same key again replaces the row.
///
/// Query Patterns:
///   - "All snapshots since T (optionally for coins X, Y, Z)"
///   - "Last market cap of every coin on dates D1..Dn"
#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct SnapshotRow {
    pub coin_id: String,
    #[serde(with = "clickhouse::serde::time::datetime")]
    pub timestamp: OffsetDateTime,

    // Stats; NULL when the source omitted the field
    pub price: Option<f64>,
    pub market_cap: Option<f64>,
    pub volume: Option<f64>,

    #[serde(with = "clickhouse::serde::time::datetime")]
    pub updated_at: OffsetDateTime,
}

/// Store-agnostic snapshot exactly as stored, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSnapshot {
    pub coin_id: String,
    pub timestamp: DateTime<Utc>,
    pub price: Option<f64>,
    pub market_cap: Option<f64>,
    pub volume: Option<f64>,
}

impl RawSnapshot {
    pub fn new(
        coin_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        price: Option<f64>,
        market_cap: Option<f64>,
        volume: Option<f64>,
    ) -> Self {
        Self {
            coin_id: coin_id.into(),
            timestamp,
            price,
            market_cap,
            volume,
        }
    }

    /// Row for the snapshot store, stamped with the write time.
    pub fn to_row(&self, updated_at: DateTime<Utc>) -> SnapshotRow {
        SnapshotRow {
            coin_id: self.coin_id.clone(),
            timestamp: chrono_to_offset(self.timestamp),
            price: self.price,
            market_cap: self.market_cap,
            volume: self.volume,
            updated_at: chrono_to_offset(updated_at),
        }
    }
}

impl From<SnapshotRow> for RawSnapshot {
    fn from(row: SnapshotRow) -> Self {
        Self {
            coin_id: row.coin_id,
            timestamp: offset_to_chrono(row.timestamp),
            price: row.price,
            market_cap: row.market_cap,
            volume: row.volume,
        }
    }
}

/// Validated snapshot with its calendar-day tag.
///
/// `price` is always finite and positive; `market_cap` and `volume` are
/// `None` when missing or unusable.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub coin_id: String,
    pub timestamp: DateTime<Utc>,
    pub date: NaiveDate,
    pub price: f64,
    pub market_cap: Option<f64>,
    pub volume: Option<f64>,
}

/// Last market cap of a coin on a calendar day (ClickHouse aggregate).
#[derive(Debug, Clone, Deserialize, Row)]
pub struct DailyMarketCapRow {
    pub coin_id: String,
    #[serde(with = "clickhouse::serde::time::date")]
    pub date: time::Date,
    pub market_cap: Option<f64>,
}

/// Store-agnostic form of [`DailyMarketCapRow`].
#[derive(Debug, Clone, PartialEq)]
pub struct DailyMarketCap {
    pub coin_id: String,
    pub date: NaiveDate,
    pub market_cap: Option<f64>,
}

impl From<DailyMarketCapRow> for DailyMarketCap {
    fn from(row: DailyMarketCapRow) -> Self {
        Self {
            coin_id: row.coin_id,
            date: date_to_naive(row.date),
            market_cap: row.market_cap,
        }
    }
}
