//! Job to rank every coin within each of its categories.
//!
//! Rebuilds category membership from the coins' category lists, ranks each
//! category's members by their latest daily market cap and stores the
//! `{category: rank}` map as the coin's `category_ranks`.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use log::{error, info};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

use crate::{
    config::MetricsSettings,
    db::{
        models::{CoinUpdate, RunSummary, UpdateTarget},
        store::{CategoryRegistry, CoinRegistry, RunSummaryStore, SnapshotStore},
        Database,
    },
    error::MetricsError,
    metrics::{rank_by_market_cap, BatchedWriter},
    utils::{validate_market_value, BenchmarkReport, Phase, PhaseTimer},
};

pub const METRIC_TYPE: &str = "category_ranks";

pub async fn run(db: &Database, settings: &MetricsSettings) -> Result<()> {
    CategoryRanksJob::new(
        db.clickhouse.as_ref(),
        db.postgres.as_ref(),
        db.postgres.as_ref(),
        db.postgres.as_ref(),
        settings,
    )
    .run(Utc::now())
    .await
    .map(|_| ())
}

pub struct CategoryRanksJob<'a> {
    snapshots: &'a dyn SnapshotStore,
    categories: &'a dyn CategoryRegistry,
    registry: &'a dyn CoinRegistry,
    summaries: &'a dyn RunSummaryStore,
    settings: &'a MetricsSettings,
}

impl<'a> CategoryRanksJob<'a> {
    pub fn new(
        snapshots: &'a dyn SnapshotStore,
        categories: &'a dyn CategoryRegistry,
        registry: &'a dyn CoinRegistry,
        summaries: &'a dyn RunSummaryStore,
        settings: &'a MetricsSettings,
    ) -> Self {
        Self {
            snapshots,
            categories,
            registry,
            summaries,
            settings,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        info!("Starting {} job...", METRIC_TYPE);

        let mut summary = RunSummary::started(METRIC_TYPE, Utc::now());
        let mut report = BenchmarkReport::new();
        let total = PhaseTimer::start(Phase::Total);

        let result = self.process(now, &mut summary, &mut report).await;

        report.finish(total);
        summary.phases = report.to_json();
        let finished_at = Utc::now();

        match result {
            Ok(()) => {
                summary.mark_completed(finished_at);
                self.summaries.upsert_run_summary(&summary).await?;
                self.summaries.set_cron_checkpoint(METRIC_TYPE, finished_at).await?;

                info!(
                    "Completed {} job in {}ms ({} coins ranked, {} updates)",
                    METRIC_TYPE, summary.duration_ms, summary.coins_processed, summary.successful_updates
                );
                Ok(summary)
            },
            Err(e) => {
                summary.mark_failed(finished_at, &e);
                if let Err(write_err) = self.summaries.upsert_run_summary(&summary).await {
                    error!("Failed to record failed {} run: {:#}", METRIC_TYPE, write_err);
                }
                Err(e)
            },
        }
    }

    async fn process(&self, now: DateTime<Utc>, summary: &mut RunSummary, report: &mut BenchmarkReport) -> Result<()> {
        let timer = PhaseTimer::start(Phase::Query);
        let rebuilt = self.categories.rebuild_categories().await?;
        let categories = self.categories.list_categories().await?;

        // Only the latest date matters; look back a few days in case today
        // has no snapshots yet
        let since = (now - Duration::days(self.settings.window_padding_days as i64))
            .date_naive()
            .and_time(NaiveTime::MIN)
            .and_utc();
        let dates = self
            .snapshots
            .snapshot_dates_since(since)
            .await
            .map_err(MetricsError::Fetch)?;
        let Some(latest) = dates.iter().max().copied() else {
            return Err(MetricsError::NoData { since }.into());
        };
        let caps = self
            .snapshots
            .daily_market_caps(&[latest])
            .await
            .map_err(MetricsError::Fetch)?;
        report.finish(timer);

        info!(
            "Rebuilt {} categories, ranking {} of them on {}",
            rebuilt,
            categories.len(),
            latest
        );

        let timer = PhaseTimer::start(Phase::Calculation);
        let cap_by_coin: FxHashMap<&str, Option<f64>> = caps
            .iter()
            .map(|c| (c.coin_id.as_str(), validate_market_value(c.market_cap)))
            .collect();

        let mut ranks_by_coin: BTreeMap<&str, Map<String, Value>> = BTreeMap::new();
        for category in &categories {
            let member_caps: Vec<Option<f64>> = category
                .coins
                .iter()
                .map(|coin_id| cap_by_coin.get(coin_id.as_str()).copied().flatten())
                .collect();

            for (coin_id, rank) in category.coins.iter().zip(rank_by_market_cap(&member_caps)) {
                if let Some(rank) = rank {
                    ranks_by_coin
                        .entry(coin_id.as_str())
                        .or_default()
                        .insert(category.name.clone(), rank.into());
                }
            }
        }

        let updates: Vec<CoinUpdate> = ranks_by_coin
            .into_iter()
            .map(|(coin_id, ranks)| CoinUpdate {
                coin_id: coin_id.to_string(),
                target: UpdateTarget::CategoryRanks,
                fields: ranks,
            })
            .collect();
        report.finish(timer);

        let timer = PhaseTimer::start(Phase::Write);
        let written = BatchedWriter::new(self.registry, self.settings.write_chunk_size)
            .write(&updates)
            .await;
        report.finish(timer);

        summary.coins_processed = updates.len() as i64;
        summary.successful_updates = written.modified as i64;
        summary.batches_total = written.round_trips as i64;
        summary.batches_failed = written.failed_chunks as i64;

        Ok(())
    }
}
