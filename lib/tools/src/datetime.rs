//! Lenient timestamp parsing for tool arguments.
//!
//! Models do not reliably produce RFC 3339. Accepted forms, tried in order:
//!
//! - RFC 3339 (`2025-09-27T22:00:00Z`, `2025-09-27T22:00:00-04:00`)
//! - `2025-09-27 22:00:00 -0400`
//! - `2025-09-27 22:00:00` and `2025-09-27T22:00:00`, read as UTC
//! - `2025-09-27`, read as midnight UTC

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt;

const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S %z", "%Y-%m-%d %H:%M:%S%z"];
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// A UTC timestamp that deserializes from several common layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlexibleDateTime(pub DateTime<Utc>);

/// Error returned when no accepted layout matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateParseError {
    pub input: String,
}

impl fmt::Display for DateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unrecognized date '{}', expected YYYY-MM-DD HH:MM:SS",
            self.input
        )
    }
}

impl std::error::Error for DateParseError {}

impl FlexibleDateTime {
    /// Parses a timestamp in any accepted layout.
    ///
    /// # Errors
    ///
    /// Returns `DateParseError` when no layout matches.
    pub fn parse(input: &str) -> Result<Self, DateParseError> {
        let trimmed = input.trim();

        if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
            return Ok(Self(parsed.with_timezone(&Utc)));
        }
        for format in OFFSET_FORMATS {
            if let Ok(parsed) = DateTime::parse_from_str(trimmed, format) {
                return Ok(Self(parsed.with_timezone(&Utc)));
            }
        }
        for format in NAIVE_FORMATS {
            if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
                return Ok(Self(parsed.and_utc()));
            }
        }
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
            && let Some(midnight) = date.and_hms_opt(0, 0, 0)
        {
            return Ok(Self(midnight.and_utc()));
        }

        Err(DateParseError {
            input: trimmed.to_string(),
        })
    }
}

impl From<FlexibleDateTime> for DateTime<Utc> {
    fn from(value: FlexibleDateTime) -> Self {
        value.0
    }
}

impl<'de> Deserialize<'de> for FlexibleDateTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(de::Error::custom)
    }
}

impl Serialize for FlexibleDateTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0.to_rfc3339())
    }
}
