//! Pure helper functions exposed under `fn.date.*` and `fn.cron.*`.
//!
//! No helper reads the system clock; "now" comes from the context.

use std::fmt::{self, Write as _};
use std::str::FromStr;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use cron::Schedule;
use serde_json::Value;

use crate::context::format_instant;

/// Upper bound on `fn.cron.range` results.
const MAX_RANGE_ITEMS: usize = 10_000;

const HELPERS: &[&str] = &[
    "fn.date.now",
    "fn.date.format",
    "fn.date.to_date_nodash",
    "fn.date.add_days",
    "fn.date.from_ts",
    "fn.cron.next",
    "fn.cron.prev",
    "fn.cron.diff",
    "fn.cron.range",
];

/// Failure inside a helper call, reported as a type error by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HelperError(pub(crate) String);

impl fmt::Display for HelperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn is_helper(name: &str) -> bool {
    HELPERS.contains(&name)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "none",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

pub(crate) fn call(name: &str, args: &[Value], now: DateTime<Utc>) -> Result<Value, HelperError> {
    match name {
        "fn.date.now" => {
            arity(name, args, 0, 0)?;
            Ok(Value::String(format_instant(&now)))
        }
        "fn.date.format" => {
            arity(name, args, 2, 2)?;
            let instant = parse_instant(name, &args[0])?;
            format_with(name, &instant, string_arg(name, &args[1])?).map(Value::String)
        }
        "fn.date.to_date_nodash" => {
            arity(name, args, 1, 1)?;
            let instant = parse_instant(name, &args[0])?;
            Ok(Value::String(instant.format("%Y%m%d").to_string()))
        }
        "fn.date.add_days" => {
            arity(name, args, 2, 2)?;
            let instant = parse_instant(name, &args[0])?;
            let days = int_arg(name, &args[1])?;
            let shifted = Duration::try_days(days)
                .and_then(|d| instant.checked_add_signed(d))
                .ok_or_else(|| HelperError(format!("{name}: {days} days is out of range")))?;
            Ok(Value::String(shifted.format("%Y-%m-%d").to_string()))
        }
        "fn.date.from_ts" => {
            arity(name, args, 1, 1)?;
            let instant = parse_instant(name, &args[0])?;
            Ok(Value::String(format_instant(&instant)))
        }
        "fn.cron.next" | "fn.cron.prev" => {
            arity(name, args, 1, 2)?;
            let schedule = parse_cron(string_arg(name, &args[0])?)
                .map_err(|e| HelperError(format!("{name}: {e}")))?;
            let base = match args.get(1) {
                Some(v) => parse_instant(name, v)?,
                None => now,
            };
            let mut upcoming = schedule.after(&base);
            let fire = if name == "fn.cron.next" {
                upcoming.next()
            } else {
                upcoming.next_back()
            };
            fire.map(|t| Value::String(format_instant(&t)))
                .ok_or_else(|| HelperError(format!("{name}: schedule never fires")))
        }
        "fn.cron.diff" => {
            arity(name, args, 3, 3)?;
            let start = parse_instant(name, &args[0])?;
            let end = parse_instant(name, &args[1])?;
            let delta = end - start;
            let value = match string_arg(name, &args[2])? {
                "seconds" => delta.num_seconds(),
                "minutes" => delta.num_minutes(),
                "hours" => delta.num_hours(),
                "days" => delta.num_days(),
                "weeks" => delta.num_weeks(),
                other => {
                    return Err(HelperError(format!(
                        "{name}: unknown unit `{other}` (seconds, minutes, hours, days, weeks)"
                    )))
                }
            };
            Ok(Value::from(value))
        }
        "fn.cron.range" => {
            arity(name, args, 3, 3)?;
            let start = parse_instant(name, &args[0])?;
            let end = parse_instant(name, &args[1])?;
            let schedule = parse_cron(string_arg(name, &args[2])?)
                .map_err(|e| HelperError(format!("{name}: {e}")))?;
            fire_times(&schedule, start, end)
                .map(|times| {
                    Value::Array(times.iter().map(|t| Value::String(format_instant(t))).collect())
                })
                .map_err(|e| HelperError(format!("{name}: {e}")))
        }
        other => Err(HelperError(format!("unknown helper function `{other}`"))),
    }
}

/// Parse a cron expression; five-field expressions get a leading seconds
/// field of `0`.
///
/// # Errors
///
/// Returns a description of the parse failure.
pub fn parse_cron(expr: &str) -> Result<Schedule, String> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| format!("invalid cron expression `{expr}`: {e}"))
}

/// Fire times of `schedule` within `[start, end)`.
///
/// # Errors
///
/// Returns an error if the window holds more than an internal cap of
/// fire times.
pub fn fire_times(
    schedule: &Schedule,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>, String> {
    let mut times = Vec::new();
    let from = start - Duration::seconds(1);
    for fire in schedule.after(&from) {
        if fire >= end {
            break;
        }
        if times.len() == MAX_RANGE_ITEMS {
            return Err(format!("more than {MAX_RANGE_ITEMS} fire times in range"));
        }
        times.push(fire);
    }
    Ok(times)
}

/// Parse an instant from epoch seconds or a date / date-time string.
pub(crate) fn parse_instant(name: &str, value: &Value) -> Result<DateTime<Utc>, HelperError> {
    let parsed = match value {
        Value::Number(n) => {
            if let Some(secs) = n.as_i64() {
                Utc.timestamp_opt(secs, 0).single()
            } else {
                #[allow(clippy::cast_possible_truncation)]
                n.as_f64()
                    .and_then(|f| DateTime::from_timestamp_millis((f * 1000.0).round() as i64))
            }
        }
        Value::String(s) => parse_instant_str(s),
        other => {
            return Err(HelperError(format!(
                "{name}: expected a date, got {}",
                type_name(other)
            )))
        }
    };
    parsed.ok_or_else(|| {
        let shown = value.as_str().map_or_else(|| value.to_string(), str::to_string);
        HelperError(format!("{name}: cannot parse `{shown}` as a date"))
    })
}

pub(crate) fn parse_instant_str(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%Y%m%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
        }
    }
    None
}

fn format_with(name: &str, instant: &DateTime<Utc>, fmt: &str) -> Result<String, HelperError> {
    let items: Vec<Item<'_>> = StrftimeItems::new(fmt).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(HelperError(format!("{name}: invalid format string `{fmt}`")));
    }
    let mut out = String::new();
    write!(out, "{}", instant.format_with_items(items.iter()))
        .map_err(|_| HelperError(format!("{name}: cannot format with `{fmt}`")))?;
    Ok(out)
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), HelperError> {
    if (min..=max).contains(&args.len()) {
        return Ok(());
    }
    let expected = if min == max {
        min.to_string()
    } else {
        format!("{min} to {max}")
    };
    Err(HelperError(format!(
        "{name} takes {expected} argument(s), got {}",
        args.len()
    )))
}

fn string_arg<'v>(name: &str, value: &'v Value) -> Result<&'v str, HelperError> {
    value.as_str().ok_or_else(|| {
        HelperError(format!("{name}: expected a string, got {}", type_name(value)))
    })
}

fn int_arg(name: &str, value: &Value) -> Result<i64, HelperError> {
    value.as_i64().ok_or_else(|| {
        HelperError(format!("{name}: expected an integer, got {}", type_name(value)))
    })
}
