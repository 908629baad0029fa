// src/strategy.rs
//! Index strategies: map a point in time to a document-store shard name.
//!
//! The persister and the query surface resolve the strategy per request, so
//! a `timed` deployment rolls over to a new index without a restart.

use crate::config::IndexConfig;
use crate::error::{Result, VigilError};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use std::sync::Arc;

pub trait IndexStrategy: Send + Sync {
    /// Shard name for the given reference time.
    fn index(&self, at: DateTime<Utc>) -> String;
}

/// Always the same index.
pub struct FixedStrategy {
    name: String,
}

impl FixedStrategy {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl IndexStrategy for FixedStrategy {
    fn index(&self, _at: DateTime<Utc>) -> String {
        self.name.clone()
    }
}

/// Time-bucketed index names in `YYYYMMDDHHMMSS` shape, truncated to the
/// configured unit: `y`ear, `m`onth, `w`eek, `d`ay or `h`our.
pub struct TimedStrategy {
    unit: TimeUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "h" => Some(TimeUnit::Hour),
            "d" => Some(TimeUnit::Day),
            "w" => Some(TimeUnit::Week),
            "m" => Some(TimeUnit::Month),
            "y" => Some(TimeUnit::Year),
            _ => None,
        }
    }
}

impl TimedStrategy {
    pub fn new(unit: TimeUnit) -> Self {
        Self { unit }
    }
}

impl IndexStrategy for TimedStrategy {
    fn index(&self, at: DateTime<Utc>) -> String {
        match self.unit {
            TimeUnit::Year => format!("{:04}0101000000", at.year()),
            TimeUnit::Month => format!("{:04}{:02}01000000", at.year(), at.month()),
            TimeUnit::Day => {
                format!("{:04}{:02}{:02}000000", at.year(), at.month(), at.day())
            }
            TimeUnit::Hour => format!(
                "{:04}{:02}{:02}{:02}0000",
                at.year(),
                at.month(),
                at.day(),
                at.hour()
            ),
            TimeUnit::Week => {
                let anchor = week_anchor(at);
                format!(
                    "{:04}{:02}{:02}000000",
                    anchor.year(),
                    anchor.month(),
                    anchor.day()
                )
            }
        }
    }
}

/// Sunday anchor of the week bucket.
///
/// Deliberately reproduces the behavior the stored data was sharded with:
/// the ISO week number is fed into Sunday-started (`%U`-style) week
/// counting, and any weekday other than Sunday selects the previous
/// week's anchor. `%U` counts the days before the year's first Sunday as
/// week 0, whose Sunday anchor is the Sunday on or before Jan 1 - in a
/// year that starts on a Sunday that is Jan 1 itself, not a week earlier.
/// Changing any of this requires reindexing existing shards.
fn week_anchor(at: DateTime<Utc>) -> NaiveDate {
    let iso = at.iso_week();
    let weekday = at.weekday().number_from_monday(); // Sunday == 7
    let week = if weekday == 7 {
        iso.week() as i64
    } else {
        iso.week() as i64 - 1
    };

    let jan1 = NaiveDate::from_ymd_opt(iso.year(), 1, 1)
        .unwrap_or_else(|| at.date_naive());
    let days_past_sunday = jan1.weekday().num_days_from_sunday() as i64;
    if week == 0 {
        jan1 - Duration::days(days_past_sunday)
    } else {
        let first_sunday = jan1 + Duration::days((7 - days_past_sunday) % 7);
        first_sunday + Duration::days((week - 1) * 7)
    }
}

/// Instantiate the strategy named in the configuration.
pub fn create(cfg: &IndexConfig) -> Result<Arc<dyn IndexStrategy>> {
    match cfg.strategy.as_str() {
        "fixed" => Ok(Arc::new(FixedStrategy::new(cfg.fixed_name.clone()))),
        "timed" => {
            let unit = TimeUnit::parse(&cfg.time_unit).ok_or_else(|| {
                VigilError::Config(format!("unknown time unit '{}'", cfg.time_unit))
            })?;
            Ok(Arc::new(TimedStrategy::new(unit)))
        }
        other => Err(VigilError::Config(format!(
            "unknown index strategy '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn at(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    #[test]
    fn fixed_ignores_time() {
        let s = FixedStrategy::new("static");
        assert_eq!(s.index(at("2014-07-10 12:34:56")), "static");
        assert_eq!(s.index(at("2024-01-01 00:00:00")), "static");
    }

    #[test]
    fn hour_bucket() {
        let s = TimedStrategy::new(TimeUnit::Hour);
        assert_eq!(s.index(at("2014-07-10 12:34:56")), "20140710120000");
        assert_eq!(s.index(at("2014-11-15 00:27:05")), "20141115000000");
    }

    #[test]
    fn day_bucket() {
        let s = TimedStrategy::new(TimeUnit::Day);
        assert_eq!(s.index(at("2014-07-10 12:34:56")), "20140710000000");
        assert_eq!(s.index(at("2014-11-15 00:00:00")), "20141115000000");
    }

    #[test]
    fn month_bucket() {
        let s = TimedStrategy::new(TimeUnit::Month);
        assert_eq!(s.index(at("2014-10-31 00:00:00")), "20141001000000");
        assert_eq!(s.index(at("2014-11-15 00:00:00")), "20141101000000");
    }

    #[test]
    fn year_bucket() {
        let s = TimedStrategy::new(TimeUnit::Year);
        assert_eq!(s.index(at("2014-10-31 00:00:00")), "20140101000000");
        assert_eq!(s.index(at("2014-01-01 00:00:00")), "20140101000000");
    }

    #[test]
    fn week_bucket_keeps_reference_behavior() {
        let s = TimedStrategy::new(TimeUnit::Week);
        // Thursday and Friday select the previous week's Sunday
        assert_eq!(s.index(at("2013-10-31 00:00:00")), "20131027000000");
        assert_eq!(s.index(at("2013-11-01 00:00:00")), "20131027000000");
        assert_eq!(s.index(at("2014-09-12 00:00:00")), "20140907000000");
        assert_eq!(s.index(at("2014-07-10 12:34:56")), "20140706000000");
        assert_eq!(s.index(at("2014-11-15 00:00:00")), "20141109000000");
        // a Sunday selects its own week
        assert_eq!(s.index(at("2013-11-03 00:00:00")), "20131103000000");
    }

    #[test]
    fn week_zero_in_a_sunday_starting_year() {
        // Jan 1 2012/2017/2023 are Sundays, so Jan 2-7 land in week 0 of
        // the Sunday-started count; their anchor is Jan 1 of the same
        // year, not a week earlier
        let s = TimedStrategy::new(TimeUnit::Week);
        assert_eq!(s.index(at("2012-01-02 00:00:00")), "20120101000000");
        assert_eq!(s.index(at("2012-01-07 12:00:00")), "20120101000000");
        assert_eq!(s.index(at("2017-01-03 00:00:00")), "20170101000000");
        assert_eq!(s.index(at("2023-01-04 00:00:00")), "20230101000000");
        // in a year that does not start on a Sunday, week 0 still reaches
        // back to the previous year's last Sunday
        assert_eq!(s.index(at("2014-01-02 00:00:00")), "20131229000000");
    }

    #[test]
    fn create_by_name() {
        let mut cfg = IndexConfig::default();
        cfg.strategy = "timed".to_string();
        cfg.time_unit = "d".to_string();
        assert!(create(&cfg).is_ok());

        cfg.strategy = "fixed".to_string();
        assert!(create(&cfg).is_ok());

        cfg.strategy = "lunar".to_string();
        assert!(create(&cfg).is_err());

        cfg.strategy = "timed".to_string();
        cfg.time_unit = "q".to_string();
        assert!(create(&cfg).is_err());
    }
}
