//! Pulls the snapshot window a run needs and normalizes it for the matrix.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use log::{debug, warn};

use crate::{
    db::{
        models::{RawSnapshot, Snapshot},
        store::SnapshotStore,
    },
    error::MetricsError,
    metrics::period::{max_lookback, LookbackPeriod},
    utils::{validate_market_value, validate_price},
};

/// Earliest timestamp a run has to load: `now` minus the longest lookback
/// minus `padding_days`, truncated to the start of that day.
///
/// The padding gives nearest-date resolution candidates on both sides of the
/// oldest target date.
pub fn window_start(now: DateTime<Utc>, periods: &[LookbackPeriod], padding_days: u32) -> DateTime<Utc> {
    let lookback = max_lookback(periods, now.date_naive());
    let start = now - lookback - Duration::days(padding_days as i64);
    start.date_naive().and_time(NaiveTime::MIN).and_utc()
}

pub struct SnapshotLoader<'a> {
    store: &'a dyn SnapshotStore,
    retention_days: Option<u32>,
}

impl<'a> SnapshotLoader<'a> {
    pub fn new(store: &'a dyn SnapshotStore, retention_days: Option<u32>) -> Self {
        Self { store, retention_days }
    }

    /// Reject windows reaching further back than the store retains.
    pub fn check_retention(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), MetricsError> {
        let Some(retention_days) = self.retention_days else {
            return Ok(());
        };

        let requested_days = (now - since).num_days();
        if requested_days > retention_days as i64 {
            return Err(MetricsError::ExceedsRetention {
                requested_days,
                retention_days,
            });
        }
        Ok(())
    }

    /// Raw snapshots since `since`, optionally only for `coin_ids`. Callers
    /// run [`SnapshotLoader::check_retention`] once against their own clock.
    ///
    /// An empty result is reported as [`MetricsError::NoData`] so callers
    /// can tell "nothing there" apart from a successful load.
    pub async fn fetch(
        &self,
        since: DateTime<Utc>,
        coin_ids: Option<&[String]>,
    ) -> Result<Vec<RawSnapshot>, MetricsError> {
        let raw = self
            .store
            .snapshots_since(since, coin_ids)
            .await
            .map_err(MetricsError::Fetch)?;

        if raw.is_empty() {
            return Err(MetricsError::NoData { since });
        }

        debug!("Fetched {} raw snapshots since {}", raw.len(), since);
        Ok(raw)
    }

    /// Validate raw snapshots, dropping unusable records with a warning.
    /// The result is ordered by coin, then timestamp.
    pub fn normalize(raw: Vec<RawSnapshot>) -> Vec<Snapshot> {
        let total = raw.len();
        let mut snapshots: Vec<Snapshot> = raw
            .into_iter()
            .filter_map(|r| match validate_price(r.price) {
                Ok(price) => Some(Snapshot {
                    date: r.timestamp.date_naive(),
                    timestamp: r.timestamp,
                    price,
                    market_cap: validate_market_value(r.market_cap),
                    volume: validate_market_value(r.volume),
                    coin_id: r.coin_id,
                }),
                Err(defect) => {
                    warn!(
                        "Dropping snapshot of {} at {}: {}",
                        r.coin_id, r.timestamp, defect
                    );
                    None
                },
            })
            .collect();

        snapshots.sort_by(|a, b| a.coin_id.cmp(&b.coin_id).then(a.timestamp.cmp(&b.timestamp)));

        if snapshots.len() < total {
            debug!("Kept {} of {} snapshots", snapshots.len(), total);
        }
        snapshots
    }

    /// Retention check against `now`, then fetch and normalize.
    pub async fn load(
        &self,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        coin_ids: Option<&[String]>,
    ) -> Result<Vec<Snapshot>, MetricsError> {
        self.check_retention(since, now)?;
        let raw = self.fetch(since, coin_ids).await?;
        Ok(Self::normalize(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::memory::MemoryStore, metrics::period::Window};
    use chrono::TimeZone;

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_window_start_covers_longest_period_plus_padding() {
        let periods = vec![
            LookbackPeriod::new("24h", Window::Minutes(1440)),
            LookbackPeriod::new("7d", Window::Minutes(7 * 1440)),
        ];
        let start = window_start(ts(20, 15), &periods, 3);

        assert_eq!(start, ts(10, 0));
    }

    #[test]
    fn test_retention_is_enforced() {
        let store = MemoryStore::new();
        let loader = SnapshotLoader::new(&store, Some(30));

        assert!(loader.check_retention(ts(1, 0), ts(20, 0)).is_ok());
        assert!(matches!(
            loader.check_retention(ts(1, 0), ts(1, 0) + Duration::days(45)),
            Err(MetricsError::ExceedsRetention {
                requested_days: 45,
                retention_days: 30
            })
        ));
        assert!(SnapshotLoader::new(&store, None)
            .check_retention(ts(1, 0) - Duration::days(3_000), ts(1, 0))
            .is_ok());
    }

    #[test]
    fn test_normalize_drops_defective_records() {
        let raw = vec![
            RawSnapshot::new("eth", ts(2, 0), Some(3_000.0), Some(-1.0), Some(f64::NAN)),
            RawSnapshot::new("btc", ts(2, 0), Some(60_000.0), Some(1.2e12), Some(3e10)),
            RawSnapshot::new("btc", ts(1, 0), None, Some(1.1e12), None),
            RawSnapshot::new("doge", ts(1, 0), Some(0.0), None, None),
            RawSnapshot::new("xrp", ts(1, 0), Some(f64::INFINITY), None, None),
            RawSnapshot::new("eth", ts(1, 0), Some(2_900.0), None, None),
        ];

        let snapshots = SnapshotLoader::normalize(raw);
        let keys: Vec<(&str, u32)> = snapshots
            .iter()
            .map(|s| (s.coin_id.as_str(), chrono::Datelike::day(&s.date)))
            .collect();

        assert_eq!(keys, vec![("btc", 2), ("eth", 1), ("eth", 2)]);
        assert_eq!(snapshots[2].market_cap, None);
        assert_eq!(snapshots[2].volume, None);
        assert_eq!(snapshots[0].market_cap, Some(1.2e12));
    }

    #[tokio::test]
    async fn test_empty_window_is_an_explicit_error() {
        let store = MemoryStore::with_snapshots(vec![RawSnapshot::new(
            "btc",
            Utc::now() - Duration::days(10),
            Some(1.0),
            None,
            None,
        )]);
        let loader = SnapshotLoader::new(&store, None);

        let result = loader.load(Utc::now() - Duration::days(2), Utc::now(), None).await;
        assert!(matches!(result, Err(MetricsError::NoData { .. })));
    }

    #[tokio::test]
    async fn test_load_respects_allow_list() {
        let now = Utc::now();
        let store = MemoryStore::with_snapshots(vec![
            RawSnapshot::new("btc", now - Duration::hours(1), Some(1.0), None, None),
            RawSnapshot::new("eth", now - Duration::hours(1), Some(2.0), None, None),
        ]);
        let loader = SnapshotLoader::new(&store, None);
        let ids = vec!["eth".to_string()];

        let snapshots = loader.load(now - Duration::days(1), now, Some(&ids)).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].coin_id, "eth");
    }

    #[tokio::test]
    async fn test_rewritten_snapshot_replaces_previous_version() {
        let ts = Utc::now() - Duration::hours(2);
        let store = MemoryStore::new();
        store
            .upsert_snapshots(&[RawSnapshot::new("btc", ts, Some(1.0), None, None)])
            .await
            .unwrap();
        store
            .upsert_snapshots(&[RawSnapshot::new("btc", ts, Some(2.0), Some(10.0), None)])
            .await
            .unwrap();

        let loader = SnapshotLoader::new(&store, None);
        let snapshots = loader.load(ts - Duration::days(1), Utc::now(), None).await.unwrap();

        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].price, 2.0);
        assert_eq!(snapshots[0].market_cap, Some(10.0));
    }

    #[tokio::test]
    async fn test_load_checks_retention_against_given_clock() {
        let store = MemoryStore::with_snapshots(vec![RawSnapshot::new("btc", ts(15, 0), Some(1.0), None, None)]);
        let loader = SnapshotLoader::new(&store, Some(30));

        // Historical run: the window is far older than the wall clock allows
        let snapshots = loader.load(ts(10, 0), ts(20, 0), None).await.unwrap();
        assert_eq!(snapshots.len(), 1);

        assert!(matches!(
            loader.load(ts(10, 0), ts(10, 0) + Duration::days(31), None).await,
            Err(MetricsError::ExceedsRetention { .. })
        ));
    }

    #[tokio::test]
    async fn test_store_failure_maps_to_fetch_error() {
        let store = MemoryStore::new();
        store.fail_fetch_for("btc");
        let loader = SnapshotLoader::new(&store, None);
        let ids = vec!["btc".to_string()];

        let result = loader.fetch(Utc::now() - Duration::days(1), Some(&ids)).await;
        assert!(matches!(result, Err(MetricsError::Fetch(_))));
    }
}
