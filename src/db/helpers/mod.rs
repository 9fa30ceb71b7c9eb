use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::db::models::EventStatus;

pub fn to_u32(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("{field} out of range: {value}"))
}

/// Fixed-width UTC form so that text comparison in SQL matches time order.
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_status(value: &str) -> Result<EventStatus> {
    match value {
        "pending" => Ok(EventStatus::Pending),
        "processing" => Ok(EventStatus::Processing),
        "completed" => Ok(EventStatus::Completed),
        "failed" => Ok(EventStatus::Failed),
        other => Err(anyhow!("unknown event status {other}")),
    }
}

pub fn to_json<T: Serialize>(value: &T, field: &str) -> Result<String> {
    serde_json::to_string(value).with_context(|| format!("failed to serialize {field}"))
}

pub fn from_json<T: DeserializeOwned>(raw: &str, field: &str) -> Result<T> {
    serde_json::from_str(raw).with_context(|| format!("failed to deserialize {field}"))
}

/// Wraps a decoding failure so it can leave a `query_map` closure.
pub fn invalid_data(err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("{err:#}"),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_formatted_datetimes_sort_chronologically() {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let whole = format_datetime(&base);
        let fractional = format_datetime(&(base + Duration::milliseconds(5)));
        let later = format_datetime(&(base + Duration::seconds(1)));

        assert_eq!(whole, "2026-03-01T09:00:00.000Z");
        assert!(whole < fractional);
        assert!(fractional < later);
    }

    #[test]
    fn test_datetime_roundtrip() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap() + Duration::milliseconds(250);
        assert_eq!(parse_datetime(&format_datetime(&at), "at").unwrap(), at);
    }

    #[test]
    fn test_parse_status_rejects_unknown() {
        assert_eq!(parse_status("failed").unwrap(), EventStatus::Failed);
        assert!(parse_status("Running").is_err());
    }
}
