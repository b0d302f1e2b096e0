//! Dense per-date, per-coin view of a snapshot window.
//!
//! Cells live in one flat vector indexed by `date_idx * n_coins + coin_idx`;
//! [`DateAxis`] and [`CoinIndex`] map dates and coin ids to those positions.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::debug;
use rustc_hash::FxHashMap;

use crate::{
    db::models::{DailyMarketCap, Snapshot},
    utils::validate_market_value,
};

/// Sorted, de-duplicated calendar dates of a window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DateAxis {
    dates: Vec<NaiveDate>,
}

impl DateAxis {
    pub fn new(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        let mut dates: Vec<NaiveDate> = dates.into_iter().collect();
        dates.sort_unstable();
        dates.dedup();
        Self { dates }
    }

    pub fn from_snapshots(snapshots: &[Snapshot]) -> Self {
        Self::new(snapshots.iter().map(|s| s.date))
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn date(&self, idx: usize) -> NaiveDate {
        self.dates[idx]
    }

    pub fn latest(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    pub fn index_of(&self, date: NaiveDate) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    /// Index of the date closest to `target` by absolute difference.
    /// Equidistant candidates resolve to the earlier date.
    pub fn nearest(&self, target: NaiveDate) -> Option<usize> {
        match self.dates.binary_search(&target) {
            Ok(idx) => Some(idx),
            Err(0) if self.dates.is_empty() => None,
            Err(0) => Some(0),
            Err(idx) if idx == self.dates.len() => Some(idx - 1),
            Err(idx) => {
                let before = target - self.dates[idx - 1];
                let after = self.dates[idx] - target;
                Some(if after < before { idx } else { idx - 1 })
            },
        }
    }
}

/// Bidirectional coin id <-> position mapping.
#[derive(Debug, Clone, Default)]
pub struct CoinIndex {
    ids: Vec<String>,
    lookup: FxHashMap<String, usize>,
}

impl CoinIndex {
    /// Position of `coin_id`, assigning the next free one if unseen.
    pub fn insert(&mut self, coin_id: &str) -> usize {
        if let Some(&idx) = self.lookup.get(coin_id) {
            return idx;
        }
        let idx = self.ids.len();
        self.ids.push(coin_id.to_string());
        self.lookup.insert(coin_id.to_string(), idx);
        idx
    }

    pub fn get(&self, coin_id: &str) -> Option<usize> {
        self.lookup.get(coin_id).copied()
    }

    pub fn id(&self, idx: usize) -> &str {
        &self.ids[idx]
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Price and market cap of a coin at one point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub market_cap: Option<f64>,
}

impl From<&Snapshot> for Observation {
    fn from(s: &Snapshot) -> Self {
        Self {
            timestamp: s.timestamp,
            price: s.price,
            market_cap: s.market_cap,
        }
    }
}

/// Ordinal ranks by market cap, descending. `ranks[i]` belongs to `caps[i]`;
/// a missing or non-finite cap gets no rank. Equal caps keep input order.
pub fn rank_by_market_cap(caps: &[Option<f64>]) -> Vec<Option<u32>> {
    let mut present: Vec<(usize, f64)> = caps
        .iter()
        .enumerate()
        .filter_map(|(idx, cap)| cap.filter(|c| c.is_finite()).map(|c| (idx, c)))
        .collect();
    // sort_by is stable, so ties stay in index order
    present.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut ranks = vec![None; caps.len()];
    for (position, (idx, _)) in present.into_iter().enumerate() {
        ranks[idx] = Some(position as u32 + 1);
    }
    ranks
}

/// Market-cap ranks across every coin in the store, for a handful of dates.
#[derive(Debug, Clone, Default)]
pub struct RankTable {
    ranks: FxHashMap<NaiveDate, FxHashMap<String, u32>>,
}

impl RankTable {
    /// Ties are broken by coin id so the order matches a batch matrix.
    pub fn from_daily_caps(caps: Vec<DailyMarketCap>) -> Self {
        let mut by_date: FxHashMap<NaiveDate, Vec<(String, Option<f64>)>> = FxHashMap::default();
        for cap in caps {
            by_date
                .entry(cap.date)
                .or_default()
                .push((cap.coin_id, validate_market_value(cap.market_cap)));
        }

        let ranks = by_date
            .into_iter()
            .map(|(date, mut coins)| {
                coins.sort_by(|a, b| a.0.cmp(&b.0));
                let caps: Vec<Option<f64>> = coins.iter().map(|(_, cap)| *cap).collect();
                let ranked = coins
                    .into_iter()
                    .zip(rank_by_market_cap(&caps))
                    .filter_map(|((coin_id, _), rank)| rank.map(|r| (coin_id, r)))
                    .collect();
                (date, ranked)
            })
            .collect();

        Self { ranks }
    }

    pub fn rank(&self, date: NaiveDate, coin_id: &str) -> Option<u32> {
        self.ranks.get(&date)?.get(coin_id).copied()
    }

    pub fn date_count(&self) -> usize {
        self.ranks.len()
    }
}

/// Per-date, per-coin snapshot matrix for one batch of coins.
#[derive(Debug, Clone)]
pub struct DailySnapshotMatrix {
    axis: DateAxis,
    coins: CoinIndex,
    /// Last observation of each (date, coin)
    cells: Vec<Option<Observation>>,
    ranks: Vec<Option<u32>>,
    /// Every observation on the latest date and the day before, per coin
    recent: Vec<Vec<Observation>>,
    /// Smallest spacing between two samples of the coin on the latest date
    sample_gaps: Vec<Option<Duration>>,
}

impl DailySnapshotMatrix {
    /// Lay `snapshots` out on `axis`. Snapshots dated outside the axis are
    /// ignored. Ranks are computed within the matrix; see
    /// [`DailySnapshotMatrix::apply_rank_table`] for store-wide ranks.
    pub fn build(snapshots: &[Snapshot], axis: DateAxis) -> Self {
        let mut coins = CoinIndex::default();
        for s in snapshots {
            coins.insert(&s.coin_id);
        }

        let n_coins = coins.len();
        let mut cells: Vec<Option<Observation>> = vec![None; axis.len() * n_coins];
        let mut recent: Vec<Vec<Observation>> = vec![Vec::new(); n_coins];
        let recent_from = axis.latest().and_then(|d| d.pred_opt());
        let mut off_axis = 0usize;

        for s in snapshots {
            let Some(date_idx) = axis.index_of(s.date) else {
                off_axis += 1;
                continue;
            };
            let Some(coin_idx) = coins.get(&s.coin_id) else {
                continue;
            };

            let obs = Observation::from(s);
            let cell = &mut cells[date_idx * n_coins + coin_idx];
            if cell.as_ref().map_or(true, |c| c.timestamp <= obs.timestamp) {
                *cell = Some(obs);
            }

            if recent_from.is_some_and(|from| s.date >= from) {
                recent[coin_idx].push(obs);
            }
        }

        if off_axis > 0 {
            debug!("Ignored {} snapshots dated outside the matrix axis", off_axis);
        }

        for samples in recent.iter_mut() {
            samples.sort_by_key(|o| o.timestamp);
        }

        let sample_gaps = recent
            .iter()
            .map(|samples| latest_day_min_gap(samples, axis.latest()))
            .collect();

        let mut matrix = Self {
            axis,
            coins,
            cells,
            ranks: Vec::new(),
            recent,
            sample_gaps,
        };
        matrix.ranks = matrix.local_ranks();
        matrix
    }

    fn local_ranks(&self) -> Vec<Option<u32>> {
        let n_coins = self.coins.len();
        let mut ranks = Vec::with_capacity(self.cells.len());
        for date_idx in 0..self.axis.len() {
            let row = &self.cells[date_idx * n_coins..(date_idx + 1) * n_coins];
            let caps: Vec<Option<f64>> = row.iter().map(|c| c.and_then(|o| o.market_cap)).collect();
            ranks.extend(rank_by_market_cap(&caps));
        }
        ranks
    }

    /// Replace the batch-local ranks with ranks from `table`.
    pub fn apply_rank_table(&mut self, table: &RankTable) {
        let n_coins = self.coins.len();
        for date_idx in 0..self.axis.len() {
            let date = self.axis.date(date_idx);
            for coin_idx in 0..n_coins {
                self.ranks[date_idx * n_coins + coin_idx] = table.rank(date, self.coins.id(coin_idx));
            }
        }
    }

    pub fn axis(&self) -> &DateAxis {
        &self.axis
    }

    pub fn coins(&self) -> &CoinIndex {
        &self.coins
    }

    pub fn is_empty(&self) -> bool {
        self.axis.is_empty() || self.coins.is_empty()
    }

    pub fn latest_index(&self) -> Option<usize> {
        self.axis.len().checked_sub(1)
    }

    pub fn cell(&self, date_idx: usize, coin_idx: usize) -> Option<&Observation> {
        self.cells[date_idx * self.coins.len() + coin_idx].as_ref()
    }

    pub fn rank(&self, date_idx: usize, coin_idx: usize) -> Option<u32> {
        self.ranks[date_idx * self.coins.len() + coin_idx]
    }

    /// Observations of the latest date and the day before, oldest first.
    pub fn recent(&self, coin_idx: usize) -> &[Observation] {
        &self.recent[coin_idx]
    }

    /// Sampling interval of one coin: the smallest spacing between two of its
    /// samples on the latest date, or one day when it has fewer than two.
    pub fn sample_gap(&self, coin_idx: usize) -> Duration {
        self.sample_gaps[coin_idx].unwrap_or_else(|| Duration::days(1))
    }

    /// Smallest [`DailySnapshotMatrix::sample_gap`] over all coins.
    pub fn min_sample_gap(&self) -> Duration {
        self.sample_gaps
            .iter()
            .flatten()
            .min()
            .copied()
            .unwrap_or_else(|| Duration::days(1))
    }
}

fn latest_day_min_gap(samples: &[Observation], latest: Option<NaiveDate>) -> Option<Duration> {
    let latest = latest?;
    let today: Vec<DateTime<Utc>> = samples
        .iter()
        .map(|o| o.timestamp)
        .filter(|ts| ts.date_naive() == latest)
        .collect();
    today.windows(2).map(|w| w[1] - w[0]).min()
}
