//! Named lookback periods (`15min`, `24h`, `ytd`, ...) and their windows.

use std::fmt;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use serde::Deserialize;

use crate::error::MetricsError;

const MINUTES_PER_DAY: i64 = 24 * 60;

/// How far back a period looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Window {
    /// Fixed duration in minutes
    Minutes(i64),
    /// Since January 1 of the latest date's year
    YearToDate,
}

impl Window {
    /// Effective duration of the window when measured back from `latest`.
    pub fn duration(&self, latest: NaiveDate) -> Duration {
        match self {
            Window::Minutes(m) => Duration::minutes(*m),
            Window::YearToDate => latest - start_of_year(latest),
        }
    }

    /// The point in time this window targets, measured back from `latest`.
    pub fn target(&self, latest: NaiveDateTime) -> NaiveDateTime {
        match self {
            Window::Minutes(m) => latest - Duration::minutes(*m),
            Window::YearToDate => start_of_year(latest.date()).and_time(Default::default()),
        }
    }

    /// Shorter than a calendar day, so only resolvable from intraday samples.
    pub fn is_intraday(&self) -> bool {
        matches!(self, Window::Minutes(m) if *m < MINUTES_PER_DAY)
    }
}

fn start_of_year(date: NaiveDate) -> NaiveDate {
    // January 1 exists for every year chrono can represent
    NaiveDate::from_yo_opt(date.year(), 1).unwrap_or(date)
}

impl TryFrom<String> for Window {
    type Error = MetricsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::str::FromStr for Window {
    type Err = MetricsError;

    /// Parses `15m`, `15min`, `4h`, `7d`, `1w` or `ytd`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().to_ascii_lowercase();
        if raw == "ytd" {
            return Ok(Window::YearToDate);
        }

        let split = raw
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| MetricsError::InvalidPeriod(s.to_string()))?;
        let (amount, unit) = raw.split_at(split);
        let amount: i64 = amount
            .parse()
            .map_err(|_| MetricsError::InvalidPeriod(s.to_string()))?;

        let per_unit = match unit {
            "m" | "min" => 1,
            "h" => 60,
            "d" => MINUTES_PER_DAY,
            "w" => 7 * MINUTES_PER_DAY,
            _ => return Err(MetricsError::InvalidPeriod(s.to_string())),
        };

        if amount <= 0 {
            return Err(MetricsError::InvalidPeriod(s.to_string()));
        }

        Ok(Window::Minutes(amount * per_unit))
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Window::YearToDate => write!(f, "ytd"),
            Window::Minutes(m) if m % MINUTES_PER_DAY == 0 => write!(f, "{}d", m / MINUTES_PER_DAY),
            Window::Minutes(m) if m % 60 == 0 => write!(f, "{}h", m / 60),
            Window::Minutes(m) => write!(f, "{}m", m),
        }
    }
}

/// A named lookback period, e.g. `weekly` = 7 days.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LookbackPeriod {
    pub name: String,
    pub window: Window,
}

impl LookbackPeriod {
    pub fn new(name: impl Into<String>, window: Window) -> Self {
        Self {
            name: name.into(),
            window,
        }
    }

    /// The stock period set written to every coin.
    pub fn defaults() -> Vec<LookbackPeriod> {
        [
            ("15min", Window::Minutes(15)),
            ("1h", Window::Minutes(60)),
            ("4h", Window::Minutes(4 * 60)),
            ("6h", Window::Minutes(6 * 60)),
            ("12h", Window::Minutes(12 * 60)),
            ("24h", Window::Minutes(MINUTES_PER_DAY)),
            ("7d", Window::Minutes(7 * MINUTES_PER_DAY)),
            ("weekly", Window::Minutes(7 * MINUTES_PER_DAY)),
            ("monthly", Window::Minutes(30 * MINUTES_PER_DAY)),
            ("ytd", Window::YearToDate),
            ("yearly", Window::Minutes(365 * MINUTES_PER_DAY)),
        ]
        .into_iter()
        .map(|(name, window)| LookbackPeriod::new(name, window))
        .collect()
    }
}

/// Longest lookback among `periods`, measured back from `latest`.
pub fn max_lookback(periods: &[LookbackPeriod], latest: NaiveDate) -> Duration {
    periods
        .iter()
        .map(|p| p.window.duration(latest))
        .max()
        .unwrap_or_else(Duration::zero)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_parse_windows() {
        assert_eq!("15m".parse::<Window>().unwrap(), Window::Minutes(15));
        assert_eq!("15min".parse::<Window>().unwrap(), Window::Minutes(15));
        assert_eq!("4h".parse::<Window>().unwrap(), Window::Minutes(240));
        assert_eq!("7d".parse::<Window>().unwrap(), Window::Minutes(7 * 1440));
        assert_eq!("1w".parse::<Window>().unwrap(), Window::Minutes(7 * 1440));
        assert_eq!("YTD".parse::<Window>().unwrap(), Window::YearToDate);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Window>().is_err());
        assert!("h".parse::<Window>().is_err());
        assert!("12".parse::<Window>().is_err());
        assert!("0d".parse::<Window>().is_err());
        assert!("3 months".parse::<Window>().is_err());
    }

    #[test]
    fn test_display_uses_largest_whole_unit() {
        assert_eq!(Window::Minutes(15).to_string(), "15m");
        assert_eq!(Window::Minutes(120).to_string(), "2h");
        assert_eq!(Window::Minutes(30 * 1440).to_string(), "30d");
        assert_eq!(Window::YearToDate.to_string(), "ytd");
    }

    #[test]
    fn test_ytd_targets_january_first() {
        let latest = date(2024, 3, 15).and_hms_opt(0, 0, 0).unwrap();
        let target = Window::YearToDate.target(latest);

        assert_eq!(target.date(), date(2024, 1, 1));
        assert_eq!(Window::YearToDate.duration(latest.date()), Duration::days(74));
    }

    #[test]
    fn test_intraday_classification() {
        assert!(Window::Minutes(15).is_intraday());
        assert!(Window::Minutes(12 * 60).is_intraday());
        assert!(!Window::Minutes(1440).is_intraday());
        assert!(!Window::YearToDate.is_intraday());
    }

    #[test]
    fn test_max_lookback_covers_ytd_late_in_year() {
        let periods = vec![
            LookbackPeriod::new("monthly", Window::Minutes(30 * 1440)),
            LookbackPeriod::new("ytd", Window::YearToDate),
        ];

        assert_eq!(max_lookback(&periods, date(2024, 1, 10)), Duration::days(30));
        assert_eq!(max_lookback(&periods, date(2024, 12, 31)), Duration::days(365));
    }
}
