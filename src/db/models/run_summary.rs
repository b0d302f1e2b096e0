use chrono::{DateTime, Utc};
use postgres_types::{FromSql, ToSql};
use serde::Serialize;
use serde_json::Value;

/// Lifecycle state of a recomputation run (Postgres enum `metrics.run_status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSql, FromSql)]
#[postgres(name = "run_status")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Progress checkpoint written while batches are still being processed
    #[postgres(name = "running")]
    Running,
    #[postgres(name = "completed")]
    Completed,
    #[postgres(name = "failed")]
    Failed,
}

/// Durable record of the latest run of one metric job (PostgreSQL).
///
/// Primary Key: metric_type. Each run overwrites the previous summary.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunSummary {
    pub metric_type: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    /// Per-phase benchmark totals, see `BenchmarkReport::to_json`
    pub phases: Value,
    pub coins_processed: i64,
    pub successful_updates: i64,
    pub batches_total: i64,
    pub batches_failed: i64,
    pub status: RunStatus,
    pub last_error: Option<String>,
    pub error_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    pub fn started(metric_type: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            metric_type: metric_type.into(),
            started_at,
            finished_at: None,
            duration_ms: 0,
            phases: Value::Object(Default::default()),
            coins_processed: 0,
            successful_updates: 0,
            batches_total: 0,
            batches_failed: 0,
            status: RunStatus::Running,
            last_error: None,
            error_at: None,
        }
    }

    pub fn mark_completed(&mut self, finished_at: DateTime<Utc>) {
        self.finish(finished_at);
        self.status = RunStatus::Completed;
        self.last_error = None;
        self.error_at = None;
    }

    pub fn mark_failed(&mut self, finished_at: DateTime<Utc>, error: &anyhow::Error) {
        self.finish(finished_at);
        self.status = RunStatus::Failed;
        self.last_error = Some(format!("{:#}", error));
        self.error_at = Some(finished_at);
    }

    fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = Some(finished_at);
        self.duration_ms = (finished_at - self.started_at).num_milliseconds();
    }
}
