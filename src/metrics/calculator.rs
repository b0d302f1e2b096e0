//! Price and market-cap rank changes per lookback period.

use chrono::{Duration, NaiveDate, NaiveTime};
use log::{debug, info};

use crate::{
    metrics::{
        matrix::{DailySnapshotMatrix, DateAxis, Observation},
        period::{LookbackPeriod, Window},
    },
    utils::round_to,
};

/// Computed change of one coin over one lookback period.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub coin_id: String,
    pub period: String,
    /// Percent change, rounded to two decimals
    pub price_change_pct: f64,
    /// Positive when the coin moved toward rank 1
    pub rank_change: Option<i64>,
}

impl ChangeRecord {
    /// Registry field holding the price change.
    pub fn performance_field(&self) -> String {
        format!("performance_{}", self.period)
    }

    /// Registry field holding the rank change.
    pub fn rank_field(&self) -> String {
        format!("rank_{}", self.period)
    }
}

/// `(latest - target) / target * 100`, rounded to two decimals. None when the
/// target price is not positive or the result is not finite.
pub fn price_change_pct(latest: f64, target: f64) -> Option<f64> {
    if target.is_nan() || target <= 0.0 {
        return None;
    }
    let pct = round_to((latest - target) / target * 100.0, 2);
    pct.is_finite().then_some(pct)
}

fn rank_change(latest: Option<u32>, target: Option<u32>) -> Option<i64> {
    Some(target? as i64 - latest? as i64)
}

/// Axis index a day-or-longer window resolves to, by nearest date.
fn resolve_target(axis: &DateAxis, latest: NaiveDate, window: &Window) -> Option<usize> {
    let target = window.target(latest.and_time(NaiveTime::MIN)).date();
    axis.nearest(target)
}

pub struct ChangeCalculator<'a> {
    periods: &'a [LookbackPeriod],
}

impl<'a> ChangeCalculator<'a> {
    pub fn new(periods: &'a [LookbackPeriod]) -> Self {
        Self { periods }
    }

    /// Dates whose ranks a calculation over `axis` may read: the latest date,
    /// the day before it when an intraday period is configured, and the
    /// resolved target of every other period.
    pub fn required_dates(&self, axis: &DateAxis) -> Vec<NaiveDate> {
        let Some(latest) = axis.latest() else {
            return vec![];
        };

        let mut dates = vec![latest];
        for period in self.periods {
            if period.window.is_intraday() {
                dates.extend(latest.pred_opt());
            } else if let Some(idx) = resolve_target(axis, latest, &period.window) {
                dates.push(axis.date(idx));
            }
        }

        dates.sort_unstable();
        dates.dedup();
        dates
    }

    /// One record per (coin, period) where both sides of the comparison exist.
    ///
    /// A period shorter than a coin's own sampling interval on the latest date
    /// gets a zero record for that coin instead of a computed one.
    pub fn calculate(&self, matrix: &DailySnapshotMatrix) -> Vec<ChangeRecord> {
        let Some(latest_idx) = matrix.latest_index() else {
            info!("Snapshot matrix is empty, no changes to calculate");
            return vec![];
        };
        if matrix.is_empty() {
            info!("Snapshot matrix has no coins, no changes to calculate");
            return vec![];
        }

        let latest = matrix.axis().date(latest_idx);
        debug!(
            "Calculating {} periods for {} coins on {} (finest sampling {:?})",
            self.periods.len(),
            matrix.coins().len(),
            latest,
            matrix.min_sample_gap()
        );
        let mut records = Vec::with_capacity(matrix.coins().len() * self.periods.len());

        for period in self.periods {
            let duration = period.window.duration(latest);

            if period.window.is_intraday() {
                intraday_changes(matrix, latest_idx, period, duration, &mut records);
                continue;
            }

            match resolve_target(matrix.axis(), latest, &period.window) {
                Some(target_idx) if target_idx != latest_idx => {
                    daily_changes(matrix, latest_idx, target_idx, period, duration, &mut records)
                },
                _ => debug!(
                    "Period {} resolves to the latest date {}, nothing to compare",
                    period.name, latest
                ),
            }
        }

        records
    }
}

/// Zero record for a coin sampled too coarsely for `period`; None when the coin
/// has no observation on the latest date.
fn neutral_change(
    matrix: &DailySnapshotMatrix,
    latest_idx: usize,
    coin_idx: usize,
    period: &LookbackPeriod,
) -> Option<ChangeRecord> {
    matrix.cell(latest_idx, coin_idx)?;
    Some(ChangeRecord {
        coin_id: matrix.coins().id(coin_idx).to_string(),
        period: period.name.clone(),
        price_change_pct: 0.0,
        rank_change: matrix.rank(latest_idx, coin_idx).map(|_| 0),
    })
}

fn daily_changes(
    matrix: &DailySnapshotMatrix,
    latest_idx: usize,
    target_idx: usize,
    period: &LookbackPeriod,
    duration: Duration,
    records: &mut Vec<ChangeRecord>,
) {
    for coin_idx in 0..matrix.coins().len() {
        if duration < matrix.sample_gap(coin_idx) {
            records.extend(neutral_change(matrix, latest_idx, coin_idx, period));
            continue;
        }
        let (Some(now), Some(then)) = (matrix.cell(latest_idx, coin_idx), matrix.cell(target_idx, coin_idx)) else {
            continue;
        };
        let Some(pct) = price_change_pct(now.price, then.price) else {
            continue;
        };

        records.push(ChangeRecord {
            coin_id: matrix.coins().id(coin_idx).to_string(),
            period: period.name.clone(),
            price_change_pct: pct,
            rank_change: rank_change(matrix.rank(latest_idx, coin_idx), matrix.rank(target_idx, coin_idx)),
        });
    }
}

fn intraday_changes(
    matrix: &DailySnapshotMatrix,
    latest_idx: usize,
    period: &LookbackPeriod,
    duration: Duration,
    records: &mut Vec<ChangeRecord>,
) {
    let latest = matrix.axis().date(latest_idx);
    let mut neutral = 0usize;

    for coin_idx in 0..matrix.coins().len() {
        if duration < matrix.sample_gap(coin_idx) {
            if let Some(record) = neutral_change(matrix, latest_idx, coin_idx, period) {
                records.push(record);
                neutral += 1;
            }
            continue;
        }

        let Some((now, earlier)) = matrix.recent(coin_idx).split_last() else {
            continue;
        };
        if now.timestamp.date_naive() != latest {
            continue;
        }
        let Some(then) = nearest_sample(earlier, now, duration) else {
            continue;
        };
        let Some(pct) = price_change_pct(now.price, then.price) else {
            continue;
        };

        let target_rank = matrix
            .axis()
            .index_of(then.timestamp.date_naive())
            .and_then(|idx| matrix.rank(idx, coin_idx));

        records.push(ChangeRecord {
            coin_id: matrix.coins().id(coin_idx).to_string(),
            period: period.name.clone(),
            price_change_pct: pct,
            rank_change: rank_change(matrix.rank(latest_idx, coin_idx), target_rank),
        });
    }

    if neutral > 0 {
        debug!(
            "Period {} ({}) is finer than the sampling of {} coins, wrote zero changes for them",
            period.name, period.window, neutral
        );
    }
}

/// Sample closest to `now - duration`; equidistant samples resolve to the
/// older one. Samples further than `duration` from that point are not a
/// usable comparison.
fn nearest_sample<'m>(samples: &'m [Observation], now: &Observation, duration: Duration) -> Option<&'m Observation> {
    let target = now.timestamp - duration;
    let mut best: Option<(&Observation, Duration)> = None;
    for sample in samples {
        let distance = (sample.timestamp - target).abs();
        if best.map_or(true, |(_, d)| distance < d) {
            best = Some((sample, distance));
        }
    }
    best.filter(|(_, distance)| *distance <= duration)
        .map(|(sample, _)| sample)
}
