//! Time-series metrics recomputation: load a snapshot window, align it into a
//! per-date matrix, compute price and rank changes per lookback period, and
//! write them back to the coin registry in chunks.

pub mod calculator;
pub mod loader;
pub mod matrix;
pub mod period;
pub mod writer;

pub use calculator::{ChangeCalculator, ChangeRecord};
pub use loader::{window_start, SnapshotLoader};
pub use matrix::{rank_by_market_cap, CoinIndex, DailySnapshotMatrix, DateAxis, Observation, RankTable};
pub use period::{max_lookback, LookbackPeriod, Window};
pub use writer::{change_updates, BatchedWriter, WriteReport};
