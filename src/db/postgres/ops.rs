use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, error};

use crate::db::{
    models::{Category, CoinUpdate, RunSummary, UpdateTarget},
    postgres::PostgresClient,
    store::{CategoryRegistry, ChunkOutcome, CoinRegistry, RunSummaryStore},
};

/// Sanitize a string for PostgreSQL by removing null bytes (0x00)
/// which are invalid in UTF-8 text columns
fn sanitize_string(s: &str) -> String {
    s.replace('\0', "")
}

/// Replaces `stats.change` with the bound object, leaving the rest of `stats`
/// alone. The WHERE clause turns an update that would not change anything into
/// a no-op, so re-applying the same values reports zero affected rows.
const UPSERT_STATS_CHANGE: &str = r#"
    INSERT INTO metrics.coins AS c (coin_id, stats, updated_at)
    VALUES ($1, jsonb_build_object('change', $2::jsonb), NOW())
    ON CONFLICT (coin_id) DO UPDATE SET
        stats = jsonb_set(COALESCE(c.stats, '{}'::jsonb), '{change}', $2::jsonb),
        updated_at = NOW()
    WHERE c.stats -> 'change' IS DISTINCT FROM $2::jsonb
"#;

const UPSERT_CATEGORY_RANKS: &str = r#"
    INSERT INTO metrics.coins AS c (coin_id, category_ranks, updated_at)
    VALUES ($1, $2::jsonb, NOW())
    ON CONFLICT (coin_id) DO UPDATE SET
        category_ranks = EXCLUDED.category_ranks,
        updated_at = NOW()
    WHERE c.category_ranks IS DISTINCT FROM EXCLUDED.category_ranks
"#;

#[async_trait]
impl CoinRegistry for PostgresClient {
    async fn apply_updates(&self, updates: &[CoinUpdate]) -> anyhow::Result<ChunkOutcome> {
        if updates.is_empty() {
            return Ok(ChunkOutcome::default());
        }

        let client = self
            .pool
            .get()
            .await
            .context("Failed to acquire PostgreSQL connection")?;
        let stats_stmt = client.prepare_cached(UPSERT_STATS_CHANGE).await?;
        let ranks_stmt = client.prepare_cached(UPSERT_CATEGORY_RANKS).await?;

        // Every statement is sent on the same connection without awaiting the
        // previous one, so tokio-postgres pipelines the whole chunk. Each
        // statement commits on its own; a failure only affects that coin.
        let results = join_all(updates.iter().map(|update| {
            let client = &client;
            let stmt = match update.target {
                UpdateTarget::StatsChange => &stats_stmt,
                UpdateTarget::CategoryRanks => &ranks_stmt,
            };
            let coin_id = sanitize_string(&update.coin_id);
            let fields = update.fields_json();
            async move { client.execute(stmt, &[&coin_id, &fields]).await }
        }))
        .await;

        let mut outcome = ChunkOutcome::default();
        for (update, result) in updates.iter().zip(results) {
            match result {
                Ok(rows) => outcome.modified += rows,
                Err(e) => {
                    error!("Failed to update coin {}: {:?}", update.coin_id, e);
                    outcome.failed.push((update.coin_id.clone(), e.to_string()));
                },
            }
        }

        debug!(
            "Applied {} coin updates ({} modified, {} failed)",
            updates.len(),
            outcome.modified,
            outcome.failed.len()
        );

        Ok(outcome)
    }
}

#[async_trait]
impl CategoryRegistry for PostgresClient {
    async fn rebuild_categories(&self) -> anyhow::Result<usize> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO metrics.categories (name, coins, coins_count, updated_at)
            SELECT category, array_agg(coin_id ORDER BY coin_id), COUNT(*)::INT, NOW()
            FROM metrics.coins, unnest(categories) AS category
            WHERE category <> ''
            GROUP BY category
            ON CONFLICT (name) DO UPDATE SET
                coins = EXCLUDED.coins,
                coins_count = EXCLUDED.coins_count,
                updated_at = NOW()
        "#;

        let written = client
            .execute(query, &[])
            .await
            .context("Failed to rebuild categories")?;

        Ok(written as usize)
    }

    async fn list_categories(&self) -> anyhow::Result<Vec<Category>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT name, category_id, coins, coins_count, updated_at
            FROM metrics.categories
            ORDER BY name
        "#;

        let rows = client.query(query, &[]).await?;
        let categories = rows
            .iter()
            .map(|row| Category {
                name: row.get("name"),
                category_id: row.get("category_id"),
                coins: row.get("coins"),
                coins_count: row.get("coins_count"),
                updated_at: row.get("updated_at"),
            })
            .collect();

        Ok(categories)
    }
}

#[async_trait]
impl RunSummaryStore for PostgresClient {
    async fn upsert_run_summary(&self, summary: &RunSummary) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO metrics.run_summaries (
                metric_type, started_at, finished_at, duration_ms, phases,
                coins_processed, successful_updates, batches_total, batches_failed,
                status, last_error, error_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
            ON CONFLICT (metric_type) DO UPDATE SET
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at,
                duration_ms = EXCLUDED.duration_ms,
                phases = EXCLUDED.phases,
                coins_processed = EXCLUDED.coins_processed,
                successful_updates = EXCLUDED.successful_updates,
                batches_total = EXCLUDED.batches_total,
                batches_failed = EXCLUDED.batches_failed,
                status = EXCLUDED.status,
                last_error = EXCLUDED.last_error,
                error_at = EXCLUDED.error_at,
                updated_at = NOW()
        "#;

        let last_error = summary.last_error.as_deref().map(sanitize_string);

        client
            .execute(
                query,
                &[
                    &summary.metric_type,
                    &summary.started_at,
                    &summary.finished_at,
                    &summary.duration_ms,
                    &summary.phases,
                    &summary.coins_processed,
                    &summary.successful_updates,
                    &summary.batches_total,
                    &summary.batches_failed,
                    &summary.status,
                    &last_error,
                    &summary.error_at,
                ],
            )
            .await
            .map_err(|e| {
                error!(
                    "Failed to write run summary for {}: {:?}",
                    summary.metric_type, e
                );
                e
            })?;

        Ok(())
    }

    async fn get_run_summary(&self, metric_type: &str) -> anyhow::Result<Option<RunSummary>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT
                metric_type, started_at, finished_at, duration_ms, phases,
                coins_processed, successful_updates, batches_total, batches_failed,
                status, last_error, error_at
            FROM metrics.run_summaries
            WHERE metric_type = $1
        "#;

        let row = client.query_opt(query, &[&metric_type]).await?;

        Ok(row.map(|row| RunSummary {
            metric_type: row.get("metric_type"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
            duration_ms: row.get("duration_ms"),
            phases: row.get("phases"),
            coins_processed: row.get("coins_processed"),
            successful_updates: row.get("successful_updates"),
            batches_total: row.get("batches_total"),
            batches_failed: row.get("batches_failed"),
            status: row.get("status"),
            last_error: row.get("last_error"),
            error_at: row.get("error_at"),
        }))
    }

    /// Set last run timestamp for a cron job
    async fn set_cron_checkpoint(&self, job_name: &str, last_run_at: DateTime<Utc>) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO metrics.cron_checkpoints (job_name, last_run_at, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (job_name) DO UPDATE SET
                last_run_at = EXCLUDED.last_run_at,
                updated_at = NOW()
        "#;

        client
            .execute(query, &[&job_name, &last_run_at])
            .await
            .map_err(|e| {
                error!(
                    "Failed to update checkpoint for cron job {}: {:?}",
                    job_name, e
                );
                e
            })?;

        Ok(())
    }
}
