//! # Validation
//!
//! Pure, total functions classifying a single raw JSON field. Every failure
//! collapses into `FieldValue::Error` or `FieldValue::Malfunction`.
use std::ops::RangeInclusive;

use chrono::{
    DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Weekday,
};
use serde_json::Value;

use crate::record::FieldValue;

/// Plausible temperature readings, in degrees.
pub const TEMPERATURE_RANGE: RangeInclusive<f64> = -50.0..=1500.0;
/// Plausible relative humidity readings, in percent.
pub const HUMIDITY_RANGE: RangeInclusive<f64> = 0.0..=100.0;

pub fn parse_timestamp(raw: Option<&Value>) -> FieldValue<String> {
    match raw.and_then(Value::as_str).and_then(normalize_timestamp) {
        Some(timestamp) => FieldValue::Valid(timestamp),
        None => FieldValue::Error,
    }
}

pub fn parse_temperature(raw: Option<&Value>) -> FieldValue<f64> {
    within(coerce_f64(raw), &TEMPERATURE_RANGE)
}

pub fn parse_humidity(raw: Option<&Value>) -> FieldValue<f64> {
    within(coerce_f64(raw), &HUMIDITY_RANGE)
}

/// Any integer is accepted, there is no range check on device ids.
pub fn parse_device_id(raw: Option<&Value>) -> FieldValue<i64> {
    match coerce_i64(raw) {
        Some(device_id) => FieldValue::Valid(device_id),
        None => FieldValue::Error,
    }
}

/// Parse an ISO-8601 string and render it canonically.
///
/// Offsets are preserved (`Z` renders as `+00:00`), naive date-times stay
/// naive and a date without a time becomes midnight. Fractional seconds are
/// only printed when non-zero.
///
/// Besides RFC 3339 this accepts the basic (`20240101T103000Z`) and extended
/// layouts, calendar, ordinal (`2024-001`) and week (`2024-W01-1`) dates,
/// reduced precision times (`T10`, `T10:30`), comma decimal separators and a
/// space in place of `T`.
pub fn normalize_timestamp(raw: &str) -> Option<String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(render_aware(&parsed));
    }

    if !raw.is_ascii() {
        return None;
    }

    let (date, time) = match raw.split_once(['T', ' ']) {
        Some((date, time)) => (date, Some(time)),
        None => (raw, None),
    };
    let date = parse_iso_date(date)?;

    let Some(time) = time else {
        return date.and_hms_opt(0, 0, 0).map(|midnight| render_naive(&midnight));
    };

    let (clock, offset) = split_offset(time)?;
    let naive = date.and_time(parse_iso_time(clock)?);

    match offset {
        Some(offset) => offset
            .from_local_datetime(&naive)
            .single()
            .map(|parsed| render_aware(&parsed)),
        None => Some(render_naive(&naive)),
    }
}

fn parse_iso_date(raw: &str) -> Option<NaiveDate> {
    if let Some((year, week)) = raw.split_once('W') {
        let year = digits(year.strip_suffix('-').unwrap_or(year), 4)?;
        let week = week.replace('-', "");
        let (week, day) = match week.len() {
            2 => (digits(&week, 2)?, 1),
            3 => (digits(&week[..2], 2)?, digits(&week[2..], 1)?),
            _ => return None,
        };
        let weekday = WEEKDAYS.get(usize::try_from(day).ok()?.checked_sub(1)?)?;
        return NaiveDate::from_isoywd_opt(year, u32::try_from(week).ok()?, *weekday);
    }

    let bytes = raw.as_bytes();
    let hyphen_at = |positions: &[usize]| positions.iter().all(|&i| bytes.get(i) == Some(&b'-'));

    match raw.len() {
        // 2024
        4 => NaiveDate::from_ymd_opt(digits(raw, 4)?, 1, 1),
        // 2024-01
        7 if hyphen_at(&[4]) => {
            NaiveDate::from_ymd_opt(digits(&raw[..4], 4)?, number(&raw[5..], 2)?, 1)
        }
        // 2024001
        7 => NaiveDate::from_yo_opt(digits(&raw[..4], 4)?, number(&raw[4..], 3)?),
        // 2024-001
        8 if hyphen_at(&[4]) => {
            NaiveDate::from_yo_opt(digits(&raw[..4], 4)?, number(&raw[5..], 3)?)
        }
        // 20240101
        8 => NaiveDate::from_ymd_opt(
            digits(&raw[..4], 4)?,
            number(&raw[4..6], 2)?,
            number(&raw[6..], 2)?,
        ),
        // 2024-01-01
        10 if hyphen_at(&[4, 7]) => NaiveDate::from_ymd_opt(
            digits(&raw[..4], 4)?,
            number(&raw[5..7], 2)?,
            number(&raw[8..], 2)?,
        ),
        _ => None,
    }
}

/// Split a time of day from its trailing UTC designator or numeric offset.
fn split_offset(raw: &str) -> Option<(&str, Option<FixedOffset>)> {
    if let Some(clock) = raw.strip_suffix(['Z', 'z']) {
        return Some((clock, FixedOffset::east_opt(0)));
    }

    let Some(at) = raw.find(['+', '-']) else {
        return Some((raw, None));
    };
    let (clock, offset) = raw.split_at(at);
    let sign = if offset.starts_with('-') { -1 } else { 1 };
    let offset = offset[1..].replace(':', "");
    let (hours, minutes) = match offset.len() {
        2 => (digits(&offset, 2)?, 0),
        4 => (digits(&offset[..2], 2)?, digits(&offset[2..], 2)?),
        _ => return None,
    };

    let offset = FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))?;

    Some((clock, Some(offset)))
}

/// `hh`, `hh:mm`, `hh:mm:ss[.fff]` or their basic forms `hhmm`, `hhmmss[.fff]`.
fn parse_iso_time(raw: &str) -> Option<NaiveTime> {
    let (clock, fraction) = match raw.split_once(['.', ',']) {
        Some((clock, fraction)) => (clock, Some(fraction)),
        None => (raw, None),
    };

    let parts: Vec<&str> = if clock.contains(':') {
        clock.split(':').collect()
    } else {
        (0..clock.len()).step_by(2).filter_map(|i| clock.get(i..i + 2)).collect()
    };
    let covered: usize = parts.iter().map(|part| part.len()).sum();
    if parts.is_empty() || parts.len() > 3 || covered != clock.replace(':', "").len() {
        return None;
    }

    let mut fields = [0u32; 3];
    for (field, part) in fields.iter_mut().zip(&parts) {
        *field = number(part, 2)?;
    }

    let nanos = match fraction {
        // Only seconds may carry a fraction.
        Some(fraction) if parts.len() == 3 => fraction_nanos(fraction)?,
        Some(_) => return None,
        None => 0,
    };

    NaiveTime::from_hms_nano_opt(fields[0], fields[1], fields[2], nanos)
}

fn fraction_nanos(raw: &str) -> Option<u32> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let padded: String = raw.chars().chain(std::iter::repeat('0')).take(9).collect();

    padded.parse().ok()
}

/// A run of exactly `width` ASCII digits.
fn digits(raw: &str, width: usize) -> Option<i32> {
    if raw.len() != width || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    raw.parse().ok()
}

fn number(raw: &str, width: usize) -> Option<u32> {
    digits(raw, width).and_then(|n| u32::try_from(n).ok())
}

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

fn render_aware(parsed: &DateTime<FixedOffset>) -> String {
    parsed.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

fn render_naive(parsed: &NaiveDateTime) -> String {
    parsed.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

fn within(value: Option<f64>, range: &RangeInclusive<f64>) -> FieldValue<f64> {
    match value {
        // NaN fails `contains`, so it lands here together with ±inf.
        Some(value) if range.contains(&value) => FieldValue::Valid(value),
        Some(_) => FieldValue::Malfunction,
        None => FieldValue::Error,
    }
}

fn coerce_f64(raw: Option<&Value>) -> Option<f64> {
    match raw? {
        Value::Number(number) => number.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn coerce_i64(raw: Option<&Value>) -> Option<i64> {
    match raw? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().and_then(truncate_f64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn truncate_f64(value: f64) -> Option<i64> {
    let truncated = value.trunc();
    if truncated.is_finite() && truncated >= i64::MIN as f64 && truncated < i64::MAX as f64 {
        Some(truncated as i64)
    } else {
        None
    }
}
