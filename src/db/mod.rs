use std::sync::Arc;

use log::info;

use crate::config::Settings;

pub mod clickhouse;
pub mod models;
pub mod postgres;
pub mod store;

#[cfg(test)]
pub(crate) mod memory;

pub use clickhouse::ClickhouseClient;
pub use postgres::PostgresClient;
pub use store::{CategoryRegistry, ChunkOutcome, CoinRegistry, RunSummaryStore, SnapshotStore};

/// Combined database client managing ClickHouse and PostgreSQL connections.
///
/// ClickHouse holds the coin snapshots (the time-series side).
/// PostgreSQL holds the coin registry, categories, run summaries and checkpoints.
#[derive(Clone)]
pub struct Database {
    pub clickhouse: Arc<ClickhouseClient>,
    pub postgres: Arc<PostgresClient>,
}

impl Database {
    pub async fn new(settings: Arc<Settings>) -> anyhow::Result<Self> {
        let clickhouse = ClickhouseClient::new(settings.clickhouse.clone()).await?;
        let postgres = PostgresClient::new(settings.postgres.clone()).await?;

        // Run migrations
        clickhouse.migrate().await?;
        postgres.migrate().await?;

        clickhouse.health_check().await?;
        postgres.health_check().await?;
        info!("Database connections ready");

        Ok(Self {
            clickhouse: Arc::new(clickhouse),
            postgres: Arc::new(postgres),
        })
    }
}
