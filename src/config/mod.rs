#[allow(clippy::module_inception)]
mod config;

pub use config::{
    ClickHouseSettings, MetricsSettings, PostgresSettings, RankingScope, ScheduleSettings,
    Settings,
};
