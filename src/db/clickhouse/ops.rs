use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use clickhouse::Row;
use log::info;
use serde::Deserialize;

use crate::{
    db::{
        clickhouse::client::ClickhouseClient,
        models::{DailyMarketCap, DailyMarketCapRow, RawSnapshot, SnapshotRow},
        store::SnapshotStore,
    },
    utils::date_to_naive,
};

const SNAPSHOT_TABLE: &str = "coin_snapshots";

#[derive(Debug, Deserialize, Row)]
struct DateRow {
    #[serde(with = "clickhouse::serde::time::date")]
    date: time::Date,
}

#[async_trait]
impl SnapshotStore for ClickhouseClient {
    async fn snapshots_since(
        &self,
        since: DateTime<Utc>,
        coin_ids: Option<&[String]>,
    ) -> anyhow::Result<Vec<RawSnapshot>> {
        // FINAL applies pending ReplacingMergeTree replacements so each
        // (coin_id, timestamp) key yields its latest written version
        let rows = match coin_ids {
            Some(ids) => {
                if ids.is_empty() {
                    return Ok(vec![]);
                }
                self.client
                    .query(
                        r#"
                    SELECT coin_id, timestamp, price, market_cap, volume, updated_at
                    FROM coin_snapshots FINAL
                    WHERE timestamp >= toDateTime(?) AND has(?, coin_id)
                    ORDER BY coin_id, timestamp
                    "#,
                    )
                    .bind(since.timestamp())
                    .bind(ids)
                    .fetch_all::<SnapshotRow>()
                    .await
            },
            None => {
                self.client
                    .query(
                        r#"
                    SELECT coin_id, timestamp, price, market_cap, volume, updated_at
                    FROM coin_snapshots FINAL
                    WHERE timestamp >= toDateTime(?)
                    ORDER BY coin_id, timestamp
                    "#,
                    )
                    .bind(since.timestamp())
                    .fetch_all::<SnapshotRow>()
                    .await
            },
        }
        .with_context(|| format!("Failed to query snapshots since {}", since))?;

        Ok(rows.into_iter().map(RawSnapshot::from).collect())
    }

    async fn coin_ids_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<String>> {
        let ids = self
            .client
            .query(
                r#"
            SELECT DISTINCT coin_id
            FROM coin_snapshots
            WHERE timestamp >= toDateTime(?)
            ORDER BY coin_id
            "#,
            )
            .bind(since.timestamp())
            .fetch_all::<String>()
            .await
            .with_context(|| format!("Failed to query coin ids since {}", since))?;

        Ok(ids)
    }

    async fn snapshot_dates_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<NaiveDate>> {
        let rows = self
            .client
            .query(
                r#"
            SELECT DISTINCT toDate(timestamp) AS date
            FROM coin_snapshots
            WHERE timestamp >= toDateTime(?)
            ORDER BY date
            "#,
            )
            .bind(since.timestamp())
            .fetch_all::<DateRow>()
            .await
            .with_context(|| format!("Failed to query snapshot dates since {}", since))?;

        Ok(rows.into_iter().map(|r| date_to_naive(r.date)).collect())
    }

    async fn daily_market_caps(&self, dates: &[NaiveDate]) -> anyhow::Result<Vec<DailyMarketCap>> {
        let Some(earliest) = dates.iter().min() else {
            return Ok(vec![]);
        };

        let day_strings: Vec<String> = dates.iter().map(|d| d.format("%Y-%m-%d").to_string()).collect();
        let earliest_ts = earliest.and_time(Default::default()).and_utc().timestamp();

        // tuple() keeps NULL market caps in play so the day's last snapshot wins
        // even when it has no market cap
        let rows = self
            .client
            .query(
                r#"
            SELECT
                coin_id,
                toDate(timestamp) AS date,
                argMax(tuple(market_cap), timestamp).1 AS market_cap
            FROM coin_snapshots FINAL
            WHERE timestamp >= toDateTime(?)
              AND has(arrayMap(d -> toDate(d), ?), toDate(timestamp))
            GROUP BY coin_id, date
            ORDER BY date, coin_id
            "#,
            )
            .bind(earliest_ts)
            .bind(&day_strings)
            .fetch_all::<DailyMarketCapRow>()
            .await
            .context("Failed to query daily market caps")?;

        Ok(rows.into_iter().map(DailyMarketCap::from).collect())
    }

    async fn upsert_snapshots(&self, snapshots: &[RawSnapshot]) -> anyhow::Result<()> {
        if snapshots.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut inserter = self
            .client
            .inserter::<SnapshotRow>(SNAPSHOT_TABLE)
            .with_max_rows(self.insert_max_rows);

        for snapshot in snapshots {
            inserter
                .write(&snapshot.to_row(now))
                .await
                .context("Failed to write snapshot")?;
            inserter.commit().await?;
        }

        inserter.end().await.context("Failed to flush snapshots")?;
        info!("Upserted {} snapshots", snapshots.len());
        Ok(())
    }
}
