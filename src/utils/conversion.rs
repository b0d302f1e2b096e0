//! Conversions between the `time` types used by the ClickHouse rows and the
//! `chrono` types used by PostgreSQL and the metrics core.

use chrono::{DateTime, NaiveDate, Utc};
use time::{Date, OffsetDateTime};

/// Convert a ClickHouse timestamp into a UTC `chrono` timestamp.
pub fn offset_to_chrono(ts: OffsetDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts.unix_timestamp(), ts.nanosecond()).unwrap_or_default()
}

/// Convert a UTC `chrono` timestamp into a ClickHouse timestamp.
///
/// Out-of-range values saturate to the Unix epoch.
pub fn chrono_to_offset(ts: DateTime<Utc>) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts.timestamp())
        .and_then(|t| t.replace_nanosecond(ts.timestamp_subsec_nanos()))
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// Convert a ClickHouse `Date` into a `NaiveDate`.
pub fn date_to_naive(date: Date) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), u8::from(date.month()) as u32, date.day() as u32)
        .unwrap_or_default()
}
