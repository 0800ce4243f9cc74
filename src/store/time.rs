//! CF-style time coordinate encoding (`"<unit> since <epoch>"`).

use crate::error::{PipelineError, PipelineResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};

/// Calendars whose day arithmetic matches the proleptic Gregorian calendar.
const GREGORIAN_CALENDARS: [&str; 3] = ["standard", "gregorian", "proleptic_gregorian"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "nanoseconds" | "nanosecond" | "ns" => Some(TimeUnit::Nanoseconds),
            "microseconds" | "microsecond" | "us" => Some(TimeUnit::Microseconds),
            "milliseconds" | "millisecond" | "ms" => Some(TimeUnit::Milliseconds),
            "seconds" | "second" | "secs" | "s" => Some(TimeUnit::Seconds),
            "minutes" | "minute" | "mins" => Some(TimeUnit::Minutes),
            "hours" | "hour" | "hrs" | "h" => Some(TimeUnit::Hours),
            "days" | "day" | "d" => Some(TimeUnit::Days),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            TimeUnit::Nanoseconds => "nanoseconds",
            TimeUnit::Microseconds => "microseconds",
            TimeUnit::Milliseconds => "milliseconds",
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
            TimeUnit::Days => "days",
        }
    }

    fn delta(self, value: i64) -> Option<TimeDelta> {
        match self {
            TimeUnit::Nanoseconds => Some(TimeDelta::nanoseconds(value)),
            TimeUnit::Microseconds => Some(TimeDelta::microseconds(value)),
            TimeUnit::Milliseconds => TimeDelta::try_milliseconds(value),
            TimeUnit::Seconds => TimeDelta::try_seconds(value),
            TimeUnit::Minutes => TimeDelta::try_minutes(value),
            TimeUnit::Hours => TimeDelta::try_hours(value),
            TimeUnit::Days => TimeDelta::try_days(value),
        }
    }

    /// Count of whole units in `delta`, or `None` if it is not a whole multiple.
    #[cfg(test)]
    fn count(self, delta: TimeDelta) -> Option<i64> {
        let ns = delta.num_nanoseconds()?;
        let per_unit: i64 = match self {
            TimeUnit::Nanoseconds => 1,
            TimeUnit::Microseconds => 1_000,
            TimeUnit::Milliseconds => 1_000_000,
            TimeUnit::Seconds => 1_000_000_000,
            TimeUnit::Minutes => 60_000_000_000,
            TimeUnit::Hours => 3_600_000_000_000,
            TimeUnit::Days => 86_400_000_000_000,
        };
        (ns % per_unit == 0).then_some(ns / per_unit)
    }
}

/// Integer time encoding relative to an epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeEncoding {
    unit: TimeUnit,
    epoch: DateTime<Utc>,
}

impl TimeEncoding {
    /// Seconds since the Unix epoch.
    #[cfg(test)]
    pub fn unix_seconds() -> Self {
        Self {
            unit: TimeUnit::Seconds,
            epoch: DateTime::UNIX_EPOCH,
        }
    }

    /// Parse a `units` attribute such as `"hours since 2022-01-01 00:00:00"`.
    pub fn parse(units: &str) -> PipelineResult<Self> {
        let invalid = || {
            PipelineError::malformed("time coordinate", format!("unsupported units `{}`", units))
        };

        let (unit, epoch) = units.split_once(" since ").ok_or_else(invalid)?;
        let unit = TimeUnit::parse(unit.trim()).ok_or_else(invalid)?;
        let epoch = parse_epoch(epoch.trim()).ok_or_else(invalid)?;

        Ok(Self { unit, epoch })
    }

    /// Reject non-Gregorian calendars, which would shift quarter boundaries.
    pub fn check_calendar(calendar: Option<&str>) -> PipelineResult<()> {
        match calendar {
            None => Ok(()),
            Some(c) if GREGORIAN_CALENDARS.contains(&c.to_lowercase().as_str()) => Ok(()),
            Some(c) => Err(PipelineError::malformed(
                "time coordinate",
                format!("unsupported calendar `{}`", c),
            )),
        }
    }

    /// Decode one stored value.
    pub fn decode(&self, value: i64) -> PipelineResult<DateTime<Utc>> {
        self.unit
            .delta(value)
            .and_then(|delta| self.epoch.checked_add_signed(delta))
            .ok_or_else(|| {
                PipelineError::malformed(
                    "time coordinate",
                    format!("value {} {} is out of range", value, self.unit.as_str()),
                )
            })
    }

    /// Encode a timestamp; fails when it is not a whole number of units.
    #[cfg(test)]
    pub fn encode(&self, time: &DateTime<Utc>) -> PipelineResult<i64> {
        self.unit
            .count(time.signed_duration_since(self.epoch))
            .ok_or_else(|| {
                PipelineError::malformed(
                    "time coordinate",
                    format!("{} is not a whole number of {}", time, self.unit.as_str()),
                )
            })
    }

    /// Render as a CF `units` attribute.
    #[cfg(test)]
    pub fn units(&self) -> String {
        format!(
            "{} since {}",
            self.unit.as_str(),
            self.epoch.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

fn parse_epoch(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    let s = s.trim_end_matches('Z').trim_end_matches("+00:00");
    for format in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_common_units() {
        let enc = TimeEncoding::parse("seconds since 1970-01-01").unwrap();
        assert_eq!(enc, TimeEncoding::unix_seconds());

        let enc = TimeEncoding::parse("hours since 2022-01-01 06:00:00").unwrap();
        assert_eq!(
            enc.decode(18).unwrap(),
            Utc.with_ymd_and_hms(2022, 1, 2, 0, 0, 0).unwrap()
        );

        let enc = TimeEncoding::parse("nanoseconds since 1970-01-01T00:00:00Z").unwrap();
        assert_eq!(
            enc.decode(1_000_000_000).unwrap(),
            Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 1).unwrap()
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(TimeEncoding::parse("fortnights since 2022-01-01").is_err());
        assert!(TimeEncoding::parse("days after 2022-01-01").is_err());
        assert!(TimeEncoding::parse("days since yesterday").is_err());
    }

    #[test]
    fn test_calendar_check() {
        assert!(TimeEncoding::check_calendar(None).is_ok());
        assert!(TimeEncoding::check_calendar(Some("proleptic_gregorian")).is_ok());
        assert!(TimeEncoding::check_calendar(Some("Standard")).is_ok());
        assert!(TimeEncoding::check_calendar(Some("360_day")).is_err());
    }

    #[test]
    fn test_encode_decode_minutes() {
        let enc = TimeEncoding::parse("minutes since 2020-01-01 00:00:00").unwrap();
        let t = Utc.with_ymd_and_hms(2020, 4, 1, 0, 30, 0).unwrap();
        let v = enc.encode(&t).unwrap();
        assert_eq!(enc.decode(v).unwrap(), t);

        let off_grid = Utc.with_ymd_and_hms(2020, 4, 1, 0, 30, 15).unwrap();
        assert!(enc.encode(&off_grid).is_err());
    }

    #[test]
    fn test_units_rendering() {
        let enc = TimeEncoding::unix_seconds();
        assert_eq!(enc.units(), "seconds since 1970-01-01 00:00:00");
        assert_eq!(TimeEncoding::parse(&enc.units()).unwrap(), enc);
    }
}
