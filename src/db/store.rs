//! Storage capabilities the metrics core depends on.
//!
//! The core never issues queries directly; it goes through these traits so the
//! same code runs against ClickHouse/PostgreSQL in production and in-memory
//! stores in tests.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::db::models::{Category, CoinUpdate, DailyMarketCap, RawSnapshot, RunSummary};

/// Time-range access to coin snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Snapshots with `timestamp >= since`, optionally limited to `coin_ids`,
    /// ordered by coin then timestamp.
    async fn snapshots_since(
        &self,
        since: DateTime<Utc>,
        coin_ids: Option<&[String]>,
    ) -> anyhow::Result<Vec<RawSnapshot>>;

    /// Distinct coin ids with at least one snapshot since `since`, sorted.
    async fn coin_ids_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<String>>;

    /// Distinct calendar dates with at least one snapshot since `since`, sorted.
    async fn snapshot_dates_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<NaiveDate>>;

    /// Last market cap of every coin on each of `dates`.
    async fn daily_market_caps(&self, dates: &[NaiveDate]) -> anyhow::Result<Vec<DailyMarketCap>>;

    /// Insert or replace snapshots keyed by `(coin_id, timestamp)`.
    async fn upsert_snapshots(&self, snapshots: &[RawSnapshot]) -> anyhow::Result<()>;
}

/// Outcome of one bulk write round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// Documents actually created or changed
    pub modified: u64,
    /// Operations that failed, with their error message
    pub failed: Vec<(String, String)>,
}

/// Write target for computed coin fields.
#[async_trait]
pub trait CoinRegistry: Send + Sync {
    /// Apply `updates` in one round trip, unordered: a failing operation does
    /// not prevent the others from being applied. An `Err` means the whole
    /// chunk could not be attempted.
    async fn apply_updates(&self, updates: &[CoinUpdate]) -> anyhow::Result<ChunkOutcome>;
}

/// Category membership documents.
#[async_trait]
pub trait CategoryRegistry: Send + Sync {
    /// Rebuild every category document from the coins' category lists.
    /// Returns the number of categories written.
    async fn rebuild_categories(&self) -> anyhow::Result<usize>;

    async fn list_categories(&self) -> anyhow::Result<Vec<Category>>;
}

/// Durable run summaries and job checkpoints.
#[async_trait]
pub trait RunSummaryStore: Send + Sync {
    /// Replace the summary stored for `summary.metric_type`.
    async fn upsert_run_summary(&self, summary: &RunSummary) -> anyhow::Result<()>;

    async fn get_run_summary(&self, metric_type: &str) -> anyhow::Result<Option<RunSummary>>;

    async fn set_cron_checkpoint(&self, job_name: &str, last_run_at: DateTime<Utc>) -> anyhow::Result<()>;
}
