//! Cron scheduler for the metric jobs.
//!
//! Runs:
//! - Recomputing time-series price and rank changes for every coin
//! - Recomputing per-category market-cap ranks

use std::sync::Arc;

use anyhow::Result;
use log::{error, info, warn};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

use crate::{config::Settings, db::Database};

use super::jobs;

/// Keeps a job from overlapping with its own previous run.
#[derive(Clone)]
struct RunGuard {
    name: &'static str,
    lock: Arc<Mutex<()>>,
}

impl RunGuard {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// None while a previous run still holds the guard.
    fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        match self.lock.clone().try_lock_owned() {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!("{} is still running, skipping this trigger", self.name);
                None
            },
        }
    }
}

/// Cron scheduler that manages the periodic metric jobs.
pub struct CronScheduler {
    db: Arc<Database>,
    settings: Arc<Settings>,
    timeseries_guard: RunGuard,
    category_guard: RunGuard,
}

impl CronScheduler {
    pub fn new(db: Arc<Database>, settings: Arc<Settings>) -> Self {
        Self {
            db,
            settings,
            timeseries_guard: RunGuard::new(jobs::timeseries_metrics::METRIC_TYPE),
            category_guard: RunGuard::new(jobs::category_ranks::METRIC_TYPE),
        }
    }

    /// Starts the cron scheduler and runs until cancellation.
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<()> {
        let mut scheduler = JobScheduler::new().await?;

        // Register all jobs
        self.register_timeseries_metrics_job(&scheduler, &cancellation_token)
            .await?;
        self.register_category_ranks_job(&scheduler).await?;

        // Start the scheduler
        scheduler.start().await?;
        info!("Cron scheduler started with {} jobs", 2);

        if self.settings.schedule.run_on_startup {
            let db = self.db.clone();
            let settings = self.settings.clone();
            let timeseries_guard = self.timeseries_guard.clone();
            let category_guard = self.category_guard.clone();
            let token = cancellation_token.child_token();

            tokio::spawn(async move {
                info!("Running all jobs once at startup");
                run_timeseries_metrics(&db, &settings, &timeseries_guard, &token).await;
                if !token.is_cancelled() {
                    run_category_ranks(&db, &settings, &category_guard).await;
                }
            });
        }

        // Wait for cancellation
        cancellation_token.cancelled().await;
        info!("Cron scheduler shutting down...");

        scheduler.shutdown().await?;
        Ok(())
    }

    async fn register_timeseries_metrics_job(
        &self,
        scheduler: &JobScheduler,
        cancellation_token: &CancellationToken,
    ) -> Result<()> {
        let db = self.db.clone();
        let settings = self.settings.clone();
        let guard = self.timeseries_guard.clone();
        let token = cancellation_token.child_token();
        let schedule = self.settings.schedule.timeseries_metrics_cron.clone();

        let job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
            let db = db.clone();
            let settings = settings.clone();
            let guard = guard.clone();
            let token = token.clone();
            Box::pin(async move {
                run_timeseries_metrics(&db, &settings, &guard, &token).await;
            })
        })?;

        scheduler.add(job).await?;
        info!("Registered timeseries_metrics job ({})", schedule);
        Ok(())
    }

    async fn register_category_ranks_job(&self, scheduler: &JobScheduler) -> Result<()> {
        let db = self.db.clone();
        let settings = self.settings.clone();
        let guard = self.category_guard.clone();
        let schedule = self.settings.schedule.category_ranks_cron.clone();

        let job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
            let db = db.clone();
            let settings = settings.clone();
            let guard = guard.clone();
            Box::pin(async move {
                run_category_ranks(&db, &settings, &guard).await;
            })
        })?;

        scheduler.add(job).await?;
        info!("Registered category_ranks job ({})", schedule);
        Ok(())
    }
}

async fn run_timeseries_metrics(db: &Database, settings: &Settings, guard: &RunGuard, token: &CancellationToken) {
    let Some(_running) = guard.try_acquire() else {
        return;
    };
    if let Err(e) = jobs::timeseries_metrics::run(db, &settings.metrics, token).await {
        error!("Failed to recompute timeseries metrics: {:#}", e);
    }
}

async fn run_category_ranks(db: &Database, settings: &Settings, guard: &RunGuard) {
    let Some(_running) = guard.try_acquire() else {
        return;
    };
    if let Err(e) = jobs::category_ranks::run(db, &settings.metrics).await {
        error!("Failed to recompute category ranks: {:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleSettings;

    #[test]
    fn test_guard_rejects_overlapping_runs() {
        let guard = RunGuard::new("timeseries_metrics");

        let first = guard.try_acquire();
        assert!(first.is_some());
        assert!(guard.clone().try_acquire().is_none());

        drop(first);
        assert!(guard.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_default_schedules_are_valid_cron_expressions() {
        let schedule = ScheduleSettings::default();
        for expr in [schedule.timeseries_metrics_cron, schedule.category_ranks_cron] {
            let job = Job::new_async(expr.as_str(), |_uuid, _lock| Box::pin(async {}));
            assert!(job.is_ok(), "{} should parse", expr);
        }
    }
}
