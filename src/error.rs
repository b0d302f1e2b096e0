use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failures of the metrics recomputation core.
///
/// Record-level data problems are not errors here; see [`SnapshotDefect`].
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The snapshot store query failed or timed out.
    #[error("snapshot query failed: {0:#}")]
    Fetch(anyhow::Error),

    /// The store returned nothing for the requested window.
    #[error("no snapshots found since {since}")]
    NoData { since: DateTime<Utc> },

    /// The requested window reaches further back than the store keeps data.
    #[error("requested window of {requested_days} days exceeds retention of {retention_days} days")]
    ExceedsRetention {
        requested_days: i64,
        retention_days: u32,
    },

    /// The run was cancelled between batches.
    #[error("run cancelled after {completed_batches} of {total_batches} batches")]
    Cancelled {
        completed_batches: usize,
        total_batches: usize,
    },

    /// A lookback window could not be parsed.
    #[error("invalid lookback window '{0}' (expected e.g. 15m, 4h, 7d, 1w or ytd)")]
    InvalidPeriod(String),
}

/// Why a raw snapshot was dropped during normalization.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum SnapshotDefect {
    #[error("missing price")]
    MissingPrice,
    #[error("non-finite price")]
    NonFinitePrice,
    #[error("non-positive price {0}")]
    NonPositivePrice(f64),
}
