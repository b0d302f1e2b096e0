use anyhow::Context;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use log::{info, warn};
use tokio_postgres::NoTls;

use crate::config::PostgresSettings;

const SCHEMA_PATH: &str = "schema/postgres.sql";

/// Split the schema file into statements. Semicolons inside `$$ .. $$` blocks
/// (the `run_status` enum guard) do not end a statement.
fn split_sql_statements(sql: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut start = 0;
    let mut in_dollar_quote = false;
    let bytes = sql.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'$' if bytes.get(i + 1) == Some(&b'$') => {
                in_dollar_quote = !in_dollar_quote;
                i += 2;
                continue;
            },
            b';' if !in_dollar_quote => {
                let stmt = &sql[start..i];
                if !stmt.trim().is_empty() {
                    statements.push(stmt);
                }
                start = i + 1;
            },
            _ => {},
        }
        i += 1;
    }

    let tail = &sql[start..];
    if !tail.trim().is_empty() {
        statements.push(tail);
    }

    statements
}

/// Pooled connection to the coin registry database (`metrics` schema).
///
/// Holds coin documents with their `stats.change` and `category_ranks`,
/// category membership, run summaries and cron checkpoints.
#[derive(Clone)]
pub struct PostgresClient {
    pub pool: Pool,
}

impl PostgresClient {
    /// Build the pool and wait until the registry accepts a connection,
    /// backing off between `connect_retries` attempts.
    pub async fn new(settings: PostgresSettings) -> anyhow::Result<Self> {
        info!(
            "Connecting to coin registry at {}:{}/{}",
            settings.host, settings.port, settings.database
        );

        let max_attempts = settings.connect_retries.max(1);
        let mut attempt = 0;

        loop {
            let mut pg_config = tokio_postgres::Config::new();
            pg_config
                .host(&settings.host)
                .port(settings.port)
                .user(&settings.user)
                .password(&settings.password)
                .dbname(&settings.database);

            let mgr_config = ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            };

            let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
            let pool = Pool::builder(mgr)
                .max_size(settings.pool_size)
                .build()
                .context("Failed to create coin registry connection pool")?;

            attempt += 1;
            match pool.get().await {
                Ok(_conn) => {
                    info!("Coin registry connected (pool size {})", settings.pool_size);
                    return Ok(Self { pool });
                },
                Err(e) if attempt >= max_attempts => {
                    return Err(anyhow::anyhow!(
                        "Coin registry unreachable after {} attempts: {}",
                        max_attempts,
                        e
                    ));
                },
                Err(e) => {
                    let delay = std::time::Duration::from_millis(100 * 2_u64.pow(attempt));
                    warn!(
                        "Coin registry connection failed (attempt {}/{}): {}, retrying in {:?}",
                        attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                },
            }
        }
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        client
            .query_one("SELECT 1 FROM pg_namespace WHERE nspname = 'metrics'", &[])
            .await
            .context("Coin registry health check failed, is the metrics schema migrated?")?;
        Ok(())
    }

    /// Apply the registry schema. Every statement is idempotent, so this runs
    /// on each startup.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        info!("Applying coin registry schema from {}", SCHEMA_PATH);
        let client = self.pool.get().await?;

        let schema = tokio::fs::read_to_string(SCHEMA_PATH)
            .await
            .with_context(|| format!("Failed to read {}", SCHEMA_PATH))?;

        let statements = split_sql_statements(&schema);
        for stmt in &statements {
            let stmt = stmt.trim();
            client
                .execute(stmt, &[])
                .await
                .with_context(|| format!("Failed to execute migration statement: {}", stmt))?;
        }

        info!("Coin registry schema ready ({} statements)", statements.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_respects_dollar_quotes() {
        let sql = r#"
            CREATE SCHEMA IF NOT EXISTS metrics;
            DO $$ BEGIN
                CREATE TYPE metrics.run_status AS ENUM ('running', 'completed', 'failed');
            EXCEPTION WHEN duplicate_object THEN NULL;
            END $$;
            CREATE TABLE t (id INT)
        "#;

        let statements: Vec<&str> = split_sql_statements(sql).into_iter().map(str::trim).collect();

        assert_eq!(statements.len(), 3);
        assert!(statements[1].starts_with("DO $$"));
        assert!(statements[1].ends_with("END $$"));
        assert_eq!(statements[2], "CREATE TABLE t (id INT)");
    }

    #[test]
    fn test_split_handles_multibyte_text() {
        let sql = "COMMENT ON SCHEMA metrics IS 'métriques €'; SELECT 1";

        assert_eq!(
            split_sql_statements(sql),
            vec!["COMMENT ON SCHEMA metrics IS 'métriques €'", " SELECT 1"]
        );
    }

    #[test]
    fn test_split_skips_empty_statements() {
        assert!(split_sql_statements(" ;\n ; ").is_empty());
    }
}
