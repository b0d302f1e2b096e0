use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::metrics::LookbackPeriod;

/// ClickHouse connection settings for the snapshot store.
#[derive(Debug, Deserialize, Clone)]
pub struct ClickHouseSettings {
    pub url: String,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Row threshold for the snapshot inserter used by `upsert_snapshots`
    #[serde(default = "default_insert_max_rows")]
    pub insert_max_rows: u64,
}

fn default_insert_max_rows() -> u64 {
    100_000
}

/// PostgreSQL database connection configuration.
///
/// Used for storing:
/// - The coin registry (identity, category membership, computed stats)
/// - Category membership documents
/// - Run summaries and cron checkpoints
#[derive(Debug, Deserialize, Clone)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Connection attempts before startup gives up
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
}

fn default_pool_size() -> usize {
    16
}

fn default_connect_retries() -> u32 {
    3
}

/// Where cross-sectional market-cap ranks are computed.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RankingScope {
    /// Rank against every coin in the snapshot store at the same date.
    #[default]
    Global,
    /// Rank only against the coins of the batch being processed.
    Batch,
}

/// Time-series metrics recomputation settings.
#[derive(Debug, Deserialize, Clone)]
pub struct MetricsSettings {
    #[serde(default = "default_periods")]
    pub periods: Vec<LookbackPeriod>,
    /// Coins loaded and computed together
    #[serde(default = "default_coin_batch_size")]
    pub coin_batch_size: usize,
    /// Update operations per registry round trip
    #[serde(default = "default_write_chunk_size")]
    pub write_chunk_size: usize,
    /// Coins between progress log lines
    #[serde(default = "default_progress_log_interval")]
    pub progress_log_interval: usize,
    #[serde(default)]
    pub ranking_scope: RankingScope,
    /// Extra days loaded before the oldest lookback target
    #[serde(default = "default_window_padding_days")]
    pub window_padding_days: u32,
    /// Oldest data the snapshot store is known to keep, if limited
    #[serde(default)]
    pub retention_days: Option<u32>,
    /// Batches between `running` summary checkpoints (0 disables them)
    #[serde(default = "default_checkpoint_every_batches")]
    pub checkpoint_every_batches: usize,
    /// Abort the run on the first failed batch query instead of skipping the batch
    #[serde(default)]
    pub abort_on_fetch_error: bool,
}

fn default_periods() -> Vec<LookbackPeriod> {
    LookbackPeriod::defaults()
}

fn default_coin_batch_size() -> usize {
    500
}

fn default_write_chunk_size() -> usize {
    1_000
}

fn default_progress_log_interval() -> usize {
    1_000
}

fn default_window_padding_days() -> u32 {
    3
}

fn default_checkpoint_every_batches() -> usize {
    10
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            periods: default_periods(),
            coin_batch_size: default_coin_batch_size(),
            write_chunk_size: default_write_chunk_size(),
            progress_log_interval: default_progress_log_interval(),
            ranking_scope: RankingScope::default(),
            window_padding_days: default_window_padding_days(),
            retention_days: None,
            checkpoint_every_batches: default_checkpoint_every_batches(),
            abort_on_fetch_error: false,
        }
    }
}

/// Cron expressions (6 fields, seconds first) for the background jobs.
#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleSettings {
    #[serde(default = "default_daily_cron")]
    pub timeseries_metrics_cron: String,
    #[serde(default = "default_daily_cron")]
    pub category_ranks_cron: String,
    /// Run every job once as soon as the scheduler starts
    #[serde(default)]
    pub run_on_startup: bool,
}

fn default_daily_cron() -> String {
    // Daily at 00:05 UTC
    "0 5 0 * * *".to_string()
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            timeseries_metrics_cron: default_daily_cron(),
            category_ranks_cron: default_daily_cron(),
            run_on_startup: false,
        }
    }
}

/// Root application configuration.
///
/// Loaded from `config.yaml` at startup, with `COINPULSE__SECTION__KEY`
/// environment variables taking precedence.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub clickhouse: ClickHouseSettings,
    pub postgres: PostgresSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
    #[serde(default)]
    pub schedule: ScheduleSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("config"))
            .add_source(Environment::with_prefix("COINPULSE").separator("__"))
            .build()?;

        let settings: Settings = s.try_deserialize()?;

        Ok(settings)
    }
}
