//! Rate-limit and transient-connection retry support.
//!
//! Classification is purely textual: backends surface limits as free-form
//! error strings, so the helpers here look for known markers and then try to
//! recover when the limit resets. Reset parsing is best-effort; when nothing
//! parses, the attempt-indexed backoff tables apply.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use regex::Regex;
use serde::Serialize;

const RATE_LIMIT_MARKERS: [&str; 10] = [
    "rate limit",
    "rate_limit",
    "ratelimit",
    "usage limit",
    "limit reached",
    "too many requests",
    "overloaded_error",
    "error: 429",
    "status code: 429",
    "http 429",
];

const CONNECTION_MARKERS: [&str; 15] = [
    "econnreset",
    "etimedout",
    "econnrefused",
    "epipe",
    "eai_again",
    "socket hang up",
    "fetch failed",
    "aborted",
    "connection reset",
    "connection refused",
    "connection closed",
    "connection failed",
    "request timeout",
    "operation timed out",
    "network error",
];

/// Rate-limit backoff in seconds, indexed by attempt (last entry is the cap).
const RATE_LIMIT_BACKOFF_SECS: [u64; 5] = [60, 300, 1800, 7200, 14400];

/// Transient-connection backoff in seconds, indexed by attempt.
const CONNECTION_BACKOFF_SECS: [u64; 5] = [5, 15, 30, 60, 120];

fn contains_marker(message: &str, markers: &[&str]) -> bool {
    let lower = message.to_lowercase();
    markers.iter().any(|marker| lower.contains(marker))
}

pub fn is_rate_limit_error(message: &str) -> bool {
    contains_marker(message, &RATE_LIMIT_MARKERS)
}

pub fn is_connection_error(message: &str) -> bool {
    contains_marker(message, &CONNECTION_MARKERS)
}

pub fn is_retryable_error(message: &str) -> bool {
    is_rate_limit_error(message) || is_connection_error(message)
}

/// What could be recovered from a rate-limit message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RateLimitInfo {
    pub is_rate_limited: bool,
    pub reset_time: Option<DateTime<Local>>,
    pub raw_match: Option<String>,
    pub seconds_until_reset: Option<u64>,
}

pub fn parse_rate_limit(message: &str) -> RateLimitInfo {
    parse_rate_limit_at(message, Local::now())
}

/// Parse `message` relative to `now`.
pub fn parse_rate_limit_at(message: &str, now: DateTime<Local>) -> RateLimitInfo {
    if !is_rate_limit_error(message) {
        return RateLimitInfo::default();
    }

    let parsed = parse_reset_phrase(message, now)
        .or_else(|| parse_relative_reset(message, now))
        .or_else(|| parse_retry_after(message, now))
        .or_else(|| parse_iso_timestamp(message));

    match parsed {
        Some((reset, raw)) => RateLimitInfo {
            is_rate_limited: true,
            seconds_until_reset: Some((reset - now).num_seconds().max(0) as u64),
            reset_time: Some(reset),
            raw_match: Some(raw),
        },
        None => RateLimitInfo {
            is_rate_limited: true,
            ..Default::default()
        },
    }
}

static DATE_RESET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)resets?\s+(?:at\s+|on\s+)?(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+(\d{1,2})(?:st|nd|rd|th)?,?\s+(?:at\s+)?(\d{1,2})(?::(\d{2}))?\s*(am|pm)?",
    )
    .expect("valid date reset regex")
});

static TIME_RESET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)resets?\s+(?:at\s+)?(\d{1,2})(?::(\d{2}))?\s*(am|pm)?")
        .expect("valid time reset regex")
});

static RELATIVE_RESET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)resets?\s+in\s+((?:\d+\s*(?:days?|d|hours?|hrs?|h|minutes?|mins?|m|seconds?|secs?|s)\b[\s,]*(?:and\s+)?)+)",
    )
    .expect("valid relative reset regex")
});

static DURATION_PART_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)\s*(days?|d|hours?|hrs?|h|minutes?|mins?|m|seconds?|secs?|s)\b")
        .expect("valid duration part regex")
});

static RETRY_AFTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry[\s_-]*after[:\s]*(\d+)\s*(seconds?|secs?|s|minutes?|mins?|m)?\b")
        .expect("valid retry-after regex")
});

static ISO_TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})")
        .expect("valid iso timestamp regex")
});

fn month_number(name: &str) -> Option<u32> {
    let month = match name.to_lowercase().get(..3)? {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn clock_time(hour: u32, minute: u32, meridiem: Option<&str>) -> Option<NaiveTime> {
    let hour = match meridiem.map(|m| m.to_lowercase()) {
        Some(m) if m == "pm" => {
            if hour > 12 {
                return None;
            }
            hour % 12 + 12
        }
        Some(_) => {
            if hour > 12 {
                return None;
            }
            hour % 12
        }
        None => hour,
    };
    NaiveTime::from_hms_opt(hour, minute, 0)
}

fn localize(naive: NaiveDateTime) -> Option<DateTime<Local>> {
    Local.from_local_datetime(&naive).earliest()
}

/// "resets Feb 4, 9pm" (current year, rolled forward) or "resets 9pm"
/// (today, rolled to tomorrow).
fn parse_reset_phrase(message: &str, now: DateTime<Local>) -> Option<(DateTime<Local>, String)> {
    if let Some(caps) = DATE_RESET_RE.captures(message) {
        let month = month_number(&caps[1])?;
        let day: u32 = caps[2].parse().ok()?;
        let hour: u32 = caps[3].parse().ok()?;
        let minute: u32 = caps
            .get(4)
            .map(|m| m.as_str().parse().unwrap_or(0))
            .unwrap_or(0);
        let time = clock_time(hour, minute, caps.get(5).map(|m| m.as_str()))?;

        let mut reset = localize(NaiveDate::from_ymd_opt(now.year(), month, day)?.and_time(time))?;
        if reset <= now {
            reset = localize(NaiveDate::from_ymd_opt(now.year() + 1, month, day)?.and_time(time))?;
        }
        return Some((reset, caps[0].trim().to_string()));
    }

    let caps = TIME_RESET_RE.captures(message)?;
    let meridiem = caps.get(3).map(|m| m.as_str());
    if caps.get(2).is_none() && meridiem.is_none() {
        // A bare number is not a clock time ("resets 3 ...").
        return None;
    }
    let hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps
        .get(2)
        .map(|m| m.as_str().parse().unwrap_or(0))
        .unwrap_or(0);
    let time = clock_time(hour, minute, meridiem)?;
    let mut reset = localize(now.date_naive().and_time(time))?;
    if reset <= now {
        reset = localize(now.date_naive().succ_opt()?.and_time(time))?;
    }
    Some((reset, caps[0].trim().to_string()))
}

fn unit_seconds(unit: &str) -> u64 {
    let unit = unit.to_lowercase();
    if unit.starts_with('d') {
        86_400
    } else if unit.starts_with('h') {
        3_600
    } else if unit.starts_with('m') {
        60
    } else {
        1
    }
}

/// "resets in 2 hours", "resets in 1h 30m".
fn parse_relative_reset(message: &str, now: DateTime<Local>) -> Option<(DateTime<Local>, String)> {
    let caps = RELATIVE_RESET_RE.captures(message)?;
    let total = DURATION_PART_RE
        .captures_iter(&caps[1])
        .try_fold(0u64, |total, part| {
            let amount: u64 = part[1].parse().ok()?;
            total.checked_add(amount.checked_mul(unit_seconds(&part[2]))?)
        })?;
    if total == 0 {
        return None;
    }
    let reset = offset_from(now, total)?;
    Some((reset, caps[0].trim().to_string()))
}

/// "retry after 3600 seconds", "Retry-After: 30".
fn parse_retry_after(message: &str, now: DateTime<Local>) -> Option<(DateTime<Local>, String)> {
    let caps = RETRY_AFTER_RE.captures(message)?;
    let amount: u64 = caps[1].parse().ok()?;
    let seconds = match caps.get(2) {
        Some(unit) => amount.checked_mul(unit_seconds(unit.as_str()))?,
        None => amount,
    };
    let reset = offset_from(now, seconds)?;
    Some((reset, caps[0].trim().to_string()))
}

/// `now + seconds`, or `None` when the result is not representable.
fn offset_from(now: DateTime<Local>, seconds: u64) -> Option<DateTime<Local>> {
    let delta = chrono::TimeDelta::try_seconds(i64::try_from(seconds).ok()?)?;
    now.checked_add_signed(delta)
}

fn parse_iso_timestamp(message: &str) -> Option<(DateTime<Local>, String)> {
    let found = ISO_TIMESTAMP_RE.find(message)?;
    let parsed = DateTime::parse_from_rfc3339(found.as_str()).ok()?;
    Some((parsed.with_timezone(&Local), found.as_str().to_string()))
}

fn table_delay(table: &[u64], attempt: u32) -> Duration {
    let index = (attempt as usize).min(table.len() - 1);
    Duration::from_secs(table[index])
}

/// Rate-limit fallback delay when no reset time could be recovered.
pub fn backoff_delay(attempt: u32) -> Duration {
    table_delay(&RATE_LIMIT_BACKOFF_SECS, attempt)
}

/// Delay before retrying after a transient connection failure.
pub fn connection_backoff_delay(attempt: u32) -> Duration {
    table_delay(&CONNECTION_BACKOFF_SECS, attempt)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryKind {
    RateLimit,
    Connection,
}

/// How long to wait before retrying a failed operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    pub kind: RetryKind,
    pub delay: Duration,
    pub rate_limit: RateLimitInfo,
}

/// Classify `message` and pick a delay for retry number `attempt` (0-based).
/// Returns `None` when the error is not retryable.
pub fn retry_delay(message: &str, attempt: u32) -> Option<RetryDecision> {
    if is_rate_limit_error(message) {
        let info = parse_rate_limit(message);
        let delay = match info.seconds_until_reset {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => backoff_delay(attempt),
        };
        return Some(RetryDecision {
            kind: RetryKind::RateLimit,
            delay,
            rate_limit: info,
        });
    }
    if is_connection_error(message) {
        return Some(RetryDecision {
            kind: RetryKind::Connection,
            delay: connection_backoff_delay(attempt),
            rate_limit: RateLimitInfo::default(),
        });
    }
    None
}

/// Sleep for `total`, calling `on_tick` with the remaining time once per second.
pub async fn wait_with_countdown<F>(total: Duration, mut on_tick: F)
where
    F: FnMut(Duration),
{
    let deadline = tokio::time::Instant::now() + total;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        let remaining = deadline - now;
        on_tick(remaining);
        tokio::time::sleep(remaining.min(Duration::from_secs(1))).await;
    }
}

/// Render a duration as `1h 05m 09s` / `4m 10s` / `7s`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
