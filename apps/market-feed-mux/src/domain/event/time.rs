//! `fromTime` normalisation.
//!
//! Time-series subscriptions accept their watermark as epoch milliseconds,
//! as a date string, or as a date-time value. Everything is normalised to
//! epoch milliseconds before it reaches the registry.

use std::fmt;
use std::time::SystemTime;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};

/// Watermark of a time-series subscription that has not requested history.
pub const NO_HISTORY: i64 = i64::MAX;

/// Naive date-time layouts accepted in addition to RFC 3339 / RFC 2822.
const NAIVE_DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// A requested `fromTime` before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum FromTime {
    /// Epoch milliseconds.
    Millis(i64),
    /// Epoch milliseconds with a fractional part.
    Fractional(f64),
    /// A date string (RFC 3339, RFC 2822, or naive ISO interpreted as UTC).
    Text(String),
    /// A date-time value.
    DateTime(DateTime<Utc>),
}

/// The `fromTime` input could not be turned into epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time {0}")]
pub struct InvalidFromTime(pub String);

impl FromTime {
    /// Resolve to epoch milliseconds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFromTime` for unparseable strings and non-finite numbers.
    pub fn to_millis(&self) -> Result<i64, InvalidFromTime> {
        match self {
            Self::Millis(millis) => Ok(*millis),
            Self::Fractional(value) => fractional_to_millis(*value),
            Self::Text(text) => parse_text(text),
            Self::DateTime(date_time) => Ok(date_time.timestamp_millis()),
        }
    }
}

impl fmt::Display for FromTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Millis(millis) => write!(f, "{millis}"),
            Self::Fractional(value) => write!(f, "{value}"),
            Self::Text(text) => f.write_str(text),
            Self::DateTime(date_time) => write!(f, "{}", date_time.to_rfc3339()),
        }
    }
}

impl From<i64> for FromTime {
    fn from(millis: i64) -> Self {
        Self::Millis(millis)
    }
}

impl From<f64> for FromTime {
    fn from(value: f64) -> Self {
        Self::Fractional(value)
    }
}

impl From<&str> for FromTime {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for FromTime {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<DateTime<Utc>> for FromTime {
    fn from(date_time: DateTime<Utc>) -> Self {
        Self::DateTime(date_time)
    }
}

impl From<DateTime<FixedOffset>> for FromTime {
    fn from(date_time: DateTime<FixedOffset>) -> Self {
        Self::DateTime(date_time.with_timezone(&Utc))
    }
}

impl From<SystemTime> for FromTime {
    fn from(time: SystemTime) -> Self {
        Self::DateTime(DateTime::<Utc>::from(time))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn fractional_to_millis(value: f64) -> Result<i64, InvalidFromTime> {
    if !value.is_finite() || value >= i64::MAX as f64 || value < i64::MIN as f64 {
        return Err(InvalidFromTime(value.to_string()));
    }
    Ok(value.trunc() as i64)
}

fn parse_text(text: &str) -> Result<i64, InvalidFromTime> {
    let trimmed = text.trim();

    if let Ok(date_time) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(date_time.timestamp_millis());
    }

    for format in NAIVE_DATE_TIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        && let Some(midnight) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(midnight.and_utc().timestamp_millis());
    }

    if let Ok(date_time) = DateTime::parse_from_rfc2822(trimmed) {
        return Ok(date_time.timestamp_millis());
    }

    Err(InvalidFromTime(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("2023-07-22T04:26:40Z", 1_690_000_000_000 ; "rfc3339 utc")]
    #[test_case("2023-07-22T06:26:40+02:00", 1_690_000_000_000 ; "rfc3339 offset")]
    #[test_case("2023-07-22T04:26:40.000", 1_690_000_000_000 ; "naive iso as utc")]
    #[test_case("2023-07-22 04:26:40", 1_690_000_000_000 ; "naive space separated")]
    #[test_case("2023-07-22", 1_689_984_000_000 ; "plain date is utc midnight")]
    #[test_case("Sat, 22 Jul 2023 04:26:40 +0000", 1_690_000_000_000 ; "rfc2822")]
    fn parses_text(input: &str, expected: i64) {
        assert_eq!(FromTime::from(input).to_millis(), Ok(expected));
    }

    #[test_case("" ; "empty")]
    #[test_case("yesterday" ; "words")]
    #[test_case("1690000000000" ; "numeric string")]
    #[test_case("2023-13-40" ; "out of range date")]
    fn rejects_text(input: &str) {
        assert!(FromTime::from(input).to_millis().is_err());
    }

    #[test]
    fn millis_pass_through() {
        assert_eq!(FromTime::from(42_i64).to_millis(), Ok(42));
        assert_eq!(FromTime::from(-5_i64).to_millis(), Ok(-5));
    }

    #[test]
    fn fractional_truncates_and_rejects_non_finite() {
        assert_eq!(FromTime::from(1500.75).to_millis(), Ok(1500));
        assert!(FromTime::from(f64::NAN).to_millis().is_err());
        assert!(FromTime::from(f64::INFINITY).to_millis().is_err());
    }

    #[test]
    fn date_time_values() {
        let utc = DateTime::<Utc>::from_timestamp_millis(1_690_000_000_000).unwrap();
        assert_eq!(FromTime::from(utc).to_millis(), Ok(1_690_000_000_000));

        let offset = DateTime::parse_from_rfc3339("2023-07-22T06:26:40+02:00").unwrap();
        assert_eq!(FromTime::from(offset).to_millis(), Ok(1_690_000_000_000));

        let system = SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(2_000);
        assert_eq!(FromTime::from(system).to_millis(), Ok(2_000));
    }

    #[test]
    fn invalid_message_names_the_input() {
        let err = FromTime::from("soon").to_millis().unwrap_err();
        assert_eq!(err.to_string(), "invalid time soon");
    }
}
