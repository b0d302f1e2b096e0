//! Utility functions for the coinpulse metrics jobs.
//!
//! This module is organized into focused submodules:
//!
//! - [`validation`] - Snapshot value validation helpers
//! - [`conversion`] - Conversions between `time` (ClickHouse) and `chrono` (PostgreSQL, core)
//! - [`benchmark`] - Scoped phase timers and per-run benchmark aggregation
//! - [`progress`] - Interval-based progress logging
//! - [`memory`] - Process memory sampling

mod benchmark;
mod conversion;
mod memory;
mod progress;
mod validation;

// ============================================
// Re-exports
// ============================================

// Instrumentation
pub use benchmark::{BenchmarkReport, Phase, PhaseMeasurement, PhaseTimer};
pub use memory::process_rss_bytes;
pub use progress::ProgressCounter;

// Conversion utilities
pub use conversion::{chrono_to_offset, date_to_naive, offset_to_chrono};

// Validation utilities
pub use validation::{round_to, validate_market_value, validate_price};
