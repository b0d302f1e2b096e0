//! Snapshot value validation.
//!
//! Prices feed a division, so a price must be finite and strictly positive to
//! be usable. Market caps and volumes may legitimately be zero (coins without
//! circulating supply data) but never negative or non-finite.

use crate::error::SnapshotDefect;

/// Validate a price; the defect explains why the record must be dropped.
#[inline]
pub fn validate_price(price: Option<f64>) -> Result<f64, SnapshotDefect> {
    match price {
        None => Err(SnapshotDefect::MissingPrice),
        Some(p) if !p.is_finite() => Err(SnapshotDefect::NonFinitePrice),
        Some(p) if p <= 0.0 => Err(SnapshotDefect::NonPositivePrice(p)),
        Some(p) => Ok(p),
    }
}

/// Validate a market cap or volume.
/// Returns the value if usable, None if it should be treated as missing.
#[inline]
pub fn validate_market_value(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v >= 0.0)
}

/// Round half away from zero to `decimals` places.
#[inline]
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
