mod category;
mod coin;
mod run_summary;
mod snapshot;

pub use category::Category;
pub use coin::{CoinUpdate, UpdateTarget};
pub use run_summary::{RunStatus, RunSummary};
pub use snapshot::{DailyMarketCap, DailyMarketCapRow, RawSnapshot, Snapshot, SnapshotRow};
