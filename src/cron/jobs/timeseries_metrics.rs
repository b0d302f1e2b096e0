//! Job to recompute price and market-cap rank changes for every coin.
//!
//! Loads the snapshot window covering the longest lookback period batch by
//! batch, computes per-period changes and merges them into each coin's
//! `stats.change` in PostgreSQL. The run is summarized in
//! `metrics.run_summaries` under `timeseries_metrics`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{MetricsSettings, RankingScope},
    db::{
        models::RunSummary,
        store::{CoinRegistry, RunSummaryStore, SnapshotStore},
        Database,
    },
    error::MetricsError,
    metrics::{
        change_updates, window_start, BatchedWriter, ChangeCalculator, DailySnapshotMatrix, DateAxis, RankTable,
        SnapshotLoader,
    },
    utils::{BenchmarkReport, Phase, PhaseTimer, ProgressCounter},
};

pub const METRIC_TYPE: &str = "timeseries_metrics";

/// Recomputes time-series metrics against the production stores.
pub async fn run(db: &Database, settings: &MetricsSettings, cancel: &CancellationToken) -> Result<()> {
    MetricsJob::new(
        db.clickhouse.as_ref(),
        db.postgres.as_ref(),
        db.postgres.as_ref(),
        settings,
    )
    .run(Utc::now(), cancel)
    .await
    .map(|_| ())
}

/// Store-wide ranks and the date axis every batch matrix is laid out on.
struct GlobalRanks {
    axis: DateAxis,
    table: RankTable,
}

/// Everything a batch needs that is fixed for the whole run.
struct RunContext<'a> {
    since: DateTime<Utc>,
    loader: SnapshotLoader<'a>,
    calculator: ChangeCalculator<'a>,
    writer: BatchedWriter<'a>,
    global: Option<GlobalRanks>,
}

pub struct MetricsJob<'a> {
    snapshots: &'a dyn SnapshotStore,
    registry: &'a dyn CoinRegistry,
    summaries: &'a dyn RunSummaryStore,
    settings: &'a MetricsSettings,
}

impl<'a> MetricsJob<'a> {
    pub fn new(
        snapshots: &'a dyn SnapshotStore,
        registry: &'a dyn CoinRegistry,
        summaries: &'a dyn RunSummaryStore,
        settings: &'a MetricsSettings,
    ) -> Self {
        Self {
            snapshots,
            registry,
            summaries,
            settings,
        }
    }

    /// Run once with lookbacks measured from `now`.
    ///
    /// Both outcomes are written to the run summary; a failed run also
    /// returns its error.
    pub async fn run(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<RunSummary> {
        info!("Starting {} job...", METRIC_TYPE);

        let mut summary = RunSummary::started(METRIC_TYPE, Utc::now());
        let mut report = BenchmarkReport::new();
        let total = PhaseTimer::start(Phase::Total);

        let result = self.process(now, cancel, &mut summary, &mut report).await;

        report.finish(total);
        summary.phases = report.to_json();
        let finished_at = Utc::now();

        match result {
            Ok(()) => {
                summary.mark_completed(finished_at);
                self.summaries.upsert_run_summary(&summary).await?;
                self.summaries.set_cron_checkpoint(METRIC_TYPE, finished_at).await?;

                info!(
                    "Completed {} job in {}ms ({} coins, {} updates, {} failed batches) [{}]",
                    METRIC_TYPE,
                    summary.duration_ms,
                    summary.coins_processed,
                    summary.successful_updates,
                    summary.batches_failed,
                    report.summary_line()
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

    async fn process(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        summary: &mut RunSummary,
        report: &mut BenchmarkReport,
    ) -> Result<()> {
        let settings = self.settings;
        let since = window_start(now, &settings.periods, settings.window_padding_days);

        let loader = SnapshotLoader::new(self.snapshots, settings.retention_days);
        loader.check_retention(since, now)?;

        let timer = PhaseTimer::start(Phase::Query);
        let coin_ids = self
            .snapshots
            .coin_ids_since(since)
            .await
            .map_err(MetricsError::Fetch)?;
        report.finish(timer);

        if coin_ids.is_empty() {
            return Err(MetricsError::NoData { since }.into());
        }

        let calculator = ChangeCalculator::new(&settings.periods);
        let global = match settings.ranking_scope {
            RankingScope::Global => Some(self.global_ranks(since, &calculator, report).await?),
            RankingScope::Batch => None,
        };

        let ctx = RunContext {
            since,
            loader,
            calculator,
            writer: BatchedWriter::new(self.registry, settings.write_chunk_size),
            global,
        };

        let batches: Vec<&[String]> = coin_ids.chunks(settings.coin_batch_size.max(1)).collect();
        summary.batches_total = batches.len() as i64;

        info!(
            "Processing {} coins in {} batches since {} ({:?} ranking)",
            coin_ids.len(),
            batches.len(),
            since,
            settings.ranking_scope
        );

        let mut progress = ProgressCounter::new(METRIC_TYPE, settings.progress_log_interval, coin_ids.len());

        for (idx, batch) in batches.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(MetricsError::Cancelled {
                    completed_batches: idx,
                    total_batches: batches.len(),
                }
                .into());
            }

            match self.process_batch(&ctx, batch, report).await {
                Ok(modified) => {
                    summary.coins_processed += batch.len() as i64;
                    summary.successful_updates += modified as i64;
                },
                Err(MetricsError::NoData { .. }) => {
                    debug!("Batch {}/{} has no snapshots in the window", idx + 1, batches.len());
                },
                Err(e) if settings.abort_on_fetch_error => return Err(e.into()),
                Err(e) => {
                    error!("Batch {}/{} failed, skipping: {}", idx + 1, batches.len(), e);
                    summary.batches_failed += 1;
                },
            }
            progress.advance(batch.len());

            let done = idx + 1;
            if settings.checkpoint_every_batches > 0
                && done % settings.checkpoint_every_batches == 0
                && done < batches.len()
            {
                summary.phases = report.to_json();
                if let Err(e) = self.summaries.upsert_run_summary(summary).await {
                    warn!("Failed to write progress checkpoint after batch {}: {:#}", done, e);
                }
            }
        }

        Ok(())
    }

    async fn global_ranks(
        &self,
        since: DateTime<Utc>,
        calculator: &ChangeCalculator<'_>,
        report: &mut BenchmarkReport,
    ) -> Result<GlobalRanks, MetricsError> {
        let timer = PhaseTimer::start(Phase::Query);
        let dates = self
            .snapshots
            .snapshot_dates_since(since)
            .await
            .map_err(MetricsError::Fetch)?;
        let axis = DateAxis::new(dates);

        let Some(latest) = axis.latest() else {
            return Err(MetricsError::NoData { since });
        };

        let needed = calculator.required_dates(&axis);
        let caps = self
            .snapshots
            .daily_market_caps(&needed)
            .await
            .map_err(MetricsError::Fetch)?;
        report.finish(timer);

        let timer = PhaseTimer::start(Phase::ArrayBuild);
        let table = RankTable::from_daily_caps(caps);
        report.finish(timer);

        info!(
            "Ranked all coins on {} dates (latest {}, axis of {} dates)",
            table.date_count(),
            latest,
            axis.len()
        );

        Ok(GlobalRanks { axis, table })
    }

    /// Returns the number of registry documents modified.
    async fn process_batch(
        &self,
        ctx: &RunContext<'_>,
        batch: &[String],
        report: &mut BenchmarkReport,
    ) -> Result<u64, MetricsError> {
        let timer = PhaseTimer::start(Phase::Query);
        let fetched = ctx.loader.fetch(ctx.since, Some(batch)).await;
        report.finish(timer);
        let raw = fetched?;

        let timer = PhaseTimer::start(Phase::Conversion);
        let snapshots = SnapshotLoader::normalize(raw);
        report.finish(timer);

        let timer = PhaseTimer::start(Phase::ArrayBuild);
        let matrix = match &ctx.global {
            Some(global) => {
                let mut matrix = DailySnapshotMatrix::build(&snapshots, global.axis.clone());
                matrix.apply_rank_table(&global.table);
                matrix
            },
            None => DailySnapshotMatrix::build(&snapshots, DateAxis::from_snapshots(&snapshots)),
        };
        drop(snapshots);
        report.finish(timer);

        let timer = PhaseTimer::start(Phase::Calculation);
        let records = ctx.calculator.calculate(&matrix);
        report.finish(timer);

        let timer = PhaseTimer::start(Phase::Write);
        let written = ctx.writer.write(&change_updates(&records)).await;
        report.finish(timer);

        Ok(written.modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{
            memory::MemoryStore,
            models::{RawSnapshot, RunStatus},
        },
        metrics::LookbackPeriod,
    };
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap()
    }

    /// Coins a, b, c with one snapshot per day from March 10 to 20.
    /// On the 20th a jumps to the top of the market-cap table and c drops to
    /// the bottom; every other day the order is c, b, a.
    fn store() -> MemoryStore {
        let mut snapshots = Vec::new();
        for day in 10..=20 {
            let ts = Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap();
            let (a, c) = if day == 20 {
                ((200.0, 30.0), (10.0, 10.0))
            } else {
                ((100.0, 10.0), (20.0, 30.0))
            };
            snapshots.push(RawSnapshot::new("a", ts, Some(a.0), Some(a.1), None));
            snapshots.push(RawSnapshot::new("b", ts, Some(50.0), Some(20.0), None));
            snapshots.push(RawSnapshot::new("c", ts, Some(c.0), Some(c.1), None));
        }
        MemoryStore::with_snapshots(snapshots)
    }

    fn settings(scope: RankingScope) -> MetricsSettings {
        MetricsSettings {
            periods: vec![
                LookbackPeriod::new("24h", "1d".parse().unwrap()),
                LookbackPeriod::new("7d", "7d".parse().unwrap()),
            ],
            coin_batch_size: 1,
            ranking_scope: scope,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_writes_changes_and_summary() {
        let store = store();
        let settings = settings(RankingScope::Global);
        let job = MetricsJob::new(&store, &store, &store, &settings);

        let summary = job.run(now(), &CancellationToken::new()).await.unwrap();

        let a = store.coin("a").unwrap().change;
        assert_eq!(a["performance_7d"], 100.0);
        assert_eq!(a["performance_24h"], 100.0);
        assert_eq!(a["rank_7d"], 2);
        let c = store.coin("c").unwrap().change;
        assert_eq!(c["performance_7d"], -50.0);
        assert_eq!(c["rank_7d"], -2);
        assert_eq!(store.coin("b").unwrap().change["rank_7d"], 0);

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.coins_processed, 3);
        assert_eq!(summary.successful_updates, 3);
        assert_eq!(summary.batches_total, 3);
        assert!(summary.phases.get("query").is_some());
        assert!(summary.phases.get("total").is_some());
        assert_eq!(store.get_run_summary(METRIC_TYPE).await.unwrap(), Some(summary));
        assert!(store.checkpoint(METRIC_TYPE).is_some());
    }

    #[tokio::test]
    async fn test_batch_scope_ranks_within_each_batch() {
        let store = store();
        let settings = settings(RankingScope::Batch);
        let job = MetricsJob::new(&store, &store, &store, &settings);

        job.run(now(), &CancellationToken::new()).await.unwrap();

        // Single-coin batches: every coin is always rank 1
        assert_eq!(store.coin("a").unwrap().change["rank_7d"], 0);
        assert_eq!(store.coin("c").unwrap().change["rank_7d"], 0);
    }

    #[tokio::test]
    async fn test_second_run_modifies_nothing() {
        let store = store();
        let settings = settings(RankingScope::Global);
        let job = MetricsJob::new(&store, &store, &store, &settings);

        job.run(now(), &CancellationToken::new()).await.unwrap();
        let second = job.run(now(), &CancellationToken::new()).await.unwrap();

        assert_eq!(second.successful_updates, 0);
        assert_eq!(store.coin("a").unwrap().change["performance_7d"], 100.0);
    }

    #[tokio::test]
    async fn test_failed_batch_is_skipped() {
        let store = store();
        store.fail_fetch_for("b");
        let settings = settings(RankingScope::Global);
        let job = MetricsJob::new(&store, &store, &store, &settings);

        let summary = job.run(now(), &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.batches_failed, 1);
        assert_eq!(summary.coins_processed, 2);
        assert!(store.coin("b").is_none());
        assert!(store.coin("c").is_some());
    }

    #[tokio::test]
    async fn test_failed_batch_aborts_when_configured() {
        let store = store();
        store.fail_fetch_for("b");
        let settings = MetricsSettings {
            abort_on_fetch_error: true,
            ..settings(RankingScope::Global)
        };
        let job = MetricsJob::new(&store, &store, &store, &settings);

        let err = job.run(now(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<MetricsError>(), Some(MetricsError::Fetch(_))));

        let summary = store.get_run_summary(METRIC_TYPE).await.unwrap().unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
        assert!(summary.last_error.unwrap().contains("simulated timeout"));
        assert!(summary.error_at.is_some());
        assert!(store.checkpoint(METRIC_TYPE).is_none());
    }

    #[tokio::test]
    async fn test_cancelled_run_is_recorded_as_failed() {
        let store = store();
        let settings = settings(RankingScope::Global);
        let job = MetricsJob::new(&store, &store, &store, &settings);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = job.run(now(), &cancel).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MetricsError>(),
            Some(MetricsError::Cancelled {
                completed_batches: 0,
                total_batches: 3
            })
        ));

        let summary = store.get_run_summary(METRIC_TYPE).await.unwrap().unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
        assert!(summary.last_error.unwrap().contains("cancelled"));
        assert_eq!(store.coin_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_store_fails_with_no_data() {
        let store = MemoryStore::new();
        let settings = settings(RankingScope::Global);
        let job = MetricsJob::new(&store, &store, &store, &settings);

        let err = job.run(now(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<MetricsError>(), Some(MetricsError::NoData { .. })));
        assert_eq!(
            store.get_run_summary(METRIC_TYPE).await.unwrap().unwrap().status,
            RunStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_historical_run_within_retention_succeeds() {
        let store = store();
        let settings = MetricsSettings {
            retention_days: Some(30),
            ..settings(RankingScope::Global)
        };
        let job = MetricsJob::new(&store, &store, &store, &settings);

        let summary = job.run(now(), &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.batches_failed, 0);
        assert_eq!(summary.coins_processed, 3);
        assert_eq!(store.coin("a").unwrap().change["performance_7d"], 100.0);
    }

    #[tokio::test]
    async fn test_one_write_per_coin() {
        let store = store();
        let settings = MetricsSettings {
            coin_batch_size: 10,
            ..settings(RankingScope::Global)
        };
        let job = MetricsJob::new(&store, &store, &store, &settings);

        let summary = job.run(now(), &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.successful_updates, 3);
        assert_eq!(store.apply_calls(), 1);
        assert_eq!(store.coin("b").unwrap().change.len(), 4);
    }

    #[tokio::test]
    async fn test_running_checkpoints_are_written_between_batches() {
        let store = store();
        let settings = MetricsSettings {
            checkpoint_every_batches: 1,
            ..settings(RankingScope::Global)
        };
        let job = MetricsJob::new(&store, &store, &store, &settings);

        job.run(now(), &CancellationToken::new()).await.unwrap();

        let statuses: Vec<RunStatus> = store.summary_log().iter().map(|s| s.status).collect();
        assert_eq!(statuses, vec![RunStatus::Running, RunStatus::Running, RunStatus::Completed]);
        assert_eq!(store.summary_log()[1].coins_processed, 2);
    }
}
