pub mod config;
pub mod cron;
pub mod db;
pub mod error;
pub mod metrics;
pub mod utils;

pub use config::Settings;
pub use cron::CronScheduler;
pub use db::Database;
pub use error::MetricsError;
