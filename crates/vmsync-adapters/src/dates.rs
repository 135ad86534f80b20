//! Parsing for the remote `/Date(<payload>)/` encoding.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;

/// Dates before this year are the remote system's "no date" sentinel.
pub const MIN_VALID_YEAR: i32 = 1900;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

/// Parses `/Date(1700000000000)/`, `/Date(1700000000000-0500)/`,
/// `/Date(2024-01-15T10:30:00)/` and bare ISO-like strings. Returns `None`
/// for anything unparsable or earlier than [`MIN_VALID_YEAR`].
pub fn parse_remote_date(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    let payload = trimmed
        .strip_prefix("/Date(")
        .and_then(|rest| rest.strip_suffix(")/"))
        .unwrap_or(trimmed)
        .trim();
    if payload.is_empty() {
        return None;
    }

    let parsed = parse_epoch_millis(payload).or_else(|| parse_iso_like(payload))?;
    (parsed.year() >= MIN_VALID_YEAR).then_some(parsed)
}

/// Same as [`parse_remote_date`] for a raw JSON cell; numbers are epoch milliseconds.
pub fn parse_remote_date_value(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => parse_remote_date(s),
        JsonValue::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .filter(|dt| dt.year() >= MIN_VALID_YEAR),
        _ => None,
    }
}

fn parse_epoch_millis(payload: &str) -> Option<DateTime<Utc>> {
    // A trailing +hhmm/-hhmm offset is display-only; the millis are already UTC.
    let offset_at = payload
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '+' || *c == '-')
        .map(|(idx, _)| idx);
    let digits = match offset_at {
        Some(idx) => {
            let offset = &payload[idx + 1..];
            if offset.len() != 4 || !offset.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            &payload[..idx]
        }
        None => payload,
    };
    let millis: i64 = digits.parse().ok()?;
    DateTime::from_timestamp_millis(millis)
}

fn parse_iso_like(payload: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(payload) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(payload, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(payload, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_epoch_millisecond_payloads() {
        let dt = parse_remote_date("/Date(1700000000000)/").expect("date");
        assert_eq!(dt.to_rfc3339(), "2023-11-14T22:13:20+00:00");

        let with_offset = parse_remote_date("/Date(1700000000000-0500)/").expect("date");
        assert_eq!(with_offset, dt);
    }

    #[test]
    fn parses_iso_like_payloads() {
        let dt = parse_remote_date("/Date(2024-01-15T10:30:00)/").expect("date");
        assert_eq!(dt.to_rfc3339(), "2024-01-15T10:30:00+00:00");

        let date_only = parse_remote_date("/Date(2024-01-15)/").expect("date");
        assert_eq!(date_only.to_rfc3339(), "2024-01-15T00:00:00+00:00");

        let bare = parse_remote_date("2024-03-02T08:00:00Z").expect("date");
        assert_eq!(bare.to_rfc3339(), "2024-03-02T08:00:00+00:00");

        assert!(parse_remote_date("01/15/2024 10:30:00 AM").is_some());
    }

    #[test]
    fn sentinel_and_garbage_become_none() {
        assert_eq!(parse_remote_date("/Date(1899-12-30T00:00:00)/"), None);
        assert_eq!(parse_remote_date("/Date(-62135596800000)/"), None);
        assert_eq!(parse_remote_date("/Date()/"), None);
        assert_eq!(parse_remote_date("/Date(not a date)/"), None);
        assert_eq!(parse_remote_date(""), None);
        assert_eq!(parse_remote_date_value(&json!(null)), None);
        assert_eq!(parse_remote_date_value(&json!(true)), None);
    }

    #[test]
    fn json_numbers_are_epoch_millis() {
        let dt = parse_remote_date_value(&json!(1700000000000i64)).expect("date");
        assert_eq!(dt.year(), 2023);
        assert!(parse_remote_date_value(&json!("/Date(1700000000000)/")).is_some());
    }
}
