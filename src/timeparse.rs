//! Timestamp normalization and free-text time range resolution.
//!
//! Every timestamp that reaches the store or a cache key goes through
//! [`parse_timestamp`] / [`format_timestamp`], so logically equal instants
//! always render identically (`YYYY-MM-DDTHH:MM:SS+HH:MM`, second precision,
//! explicit offset).
//!
//! The resolvers are stateless pattern matchers over a handful of English
//! phrases; they return `None` rather than guess.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime,
    SecondsFormat, TimeZone, Weekday,
};
use once_cell::sync::Lazy;
use regex::Regex;

/// Default event length when only a start time is given.
pub const DEFAULT_EVENT_MINUTES: i64 = 60;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

static AT_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\bat|@)\s*(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\b").unwrap());

static FROM_TO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\bfrom\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\s*(?:to|until|-)\s*(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\b",
    )
    .unwrap()
});

static WEEKDAY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:(next)\s+)?(monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b")
        .unwrap()
});

/// Parse an ISO-8601 timestamp into `tz`.
///
/// Accepts RFC 3339 (any offset, converted into `tz`), offset-less
/// date-times (interpreted in `tz`) and bare dates (midnight in `tz`).
pub fn parse_timestamp(raw: &str, tz: FixedOffset) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&tz));
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return tz.from_local_datetime(&naive).single();
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| tz.from_local_datetime(&d.and_time(NaiveTime::MIN)).single())
}

/// Canonical string form: second precision, explicit `+HH:MM` offset.
pub fn format_timestamp(dt: &DateTime<FixedOffset>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Normalize a range boundary for use in a cache key. Unparseable input is
/// only trimmed; such queries fail at the store and are never cached.
pub fn normalize_boundary(raw: &str, tz: FixedOffset) -> String {
    parse_timestamp(raw, tz)
        .map(|dt| format_timestamp(&dt))
        .unwrap_or_else(|| raw.trim().to_string())
}

/// Resolve a phrase such as "tomorrow morning" or "next week" into a
/// `(start, end)` pair of canonical timestamps in `now`'s offset.
pub fn resolve_range(text: &str, now: DateTime<FixedOffset>) -> Option<(String, String)> {
    let text = text.to_lowercase();
    let tz = *now.offset();

    if let Some((start, end)) = week_range(&text, now.date_naive()) {
        return Some((at(tz, start, 0, 0)?, at(tz, end, 0, 0)?));
    }

    let day = resolve_day(&text, now.date_naive())?;
    let (start, end) = match part_of_day(&text) {
        Some((from, to)) => (at(tz, day, from, 0)?, at(tz, day, to, 0)?),
        None => (at(tz, day, 0, 0)?, at(tz, day.succ_opt()?, 0, 0)?),
    };
    Some((start, end))
}

/// Resolve a phrase such as "tomorrow at 10" or "friday from 9 to 11:30"
/// into a concrete event start/end. Requires an explicit day keyword;
/// without an end time the event lasts [`DEFAULT_EVENT_MINUTES`].
pub fn resolve_event_start_end(
    text: &str,
    now: DateTime<FixedOffset>,
) -> Option<(String, String)> {
    let text = text.to_lowercase();
    let tz = *now.offset();
    let day = resolve_day(&text, now.date_naive())?;

    if let Some(caps) = FROM_TO_RE.captures(&text) {
        let start_time = clock(caps.get(1)?.as_str(), caps.get(2), caps.get(3))?;
        let end_time = clock(caps.get(4)?.as_str(), caps.get(5), caps.get(6))?;
        let start = tz.from_local_datetime(&day.and_time(start_time)).single()?;
        let mut end = tz.from_local_datetime(&day.and_time(end_time)).single()?;
        if end <= start {
            end += Duration::days(1);
        }
        return Some((format_timestamp(&start), format_timestamp(&end)));
    }

    let caps = AT_TIME_RE.captures(&text)?;
    let start_time = clock(caps.get(1)?.as_str(), caps.get(2), caps.get(3))?;
    let start = tz.from_local_datetime(&day.and_time(start_time)).single()?;
    let end = start + Duration::minutes(DEFAULT_EVENT_MINUTES);
    Some((format_timestamp(&start), format_timestamp(&end)))
}

fn resolve_day(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    if text.contains("day after tomorrow") {
        return today.checked_add_signed(Duration::days(2));
    }
    if text.contains("tomorrow") {
        return today.succ_opt();
    }
    if text.contains("yesterday") {
        return today.pred_opt();
    }
    if text.contains("today") || text.contains("tonight") {
        return Some(today);
    }
    let caps = WEEKDAY_RE.captures(text)?;
    let target = weekday(caps.get(2)?.as_str())?;
    let mut ahead = (7 + target.num_days_from_monday() as i64
        - today.weekday().num_days_from_monday() as i64)
        % 7;
    if caps.get(1).is_some() && ahead == 0 {
        ahead = 7;
    }
    today.checked_add_signed(Duration::days(ahead))
}

fn week_range(text: &str, today: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    let monday = today.checked_sub_signed(Duration::days(
        today.weekday().num_days_from_monday() as i64,
    ))?;
    if text.contains("weekend") {
        let skip = if text.contains("next weekend") { 12 } else { 5 };
        let saturday = monday.checked_add_signed(Duration::days(skip))?;
        return Some((saturday, saturday.checked_add_signed(Duration::days(2))?));
    }
    if text.contains("next week") {
        let start = monday.checked_add_signed(Duration::days(7))?;
        return Some((start, start.checked_add_signed(Duration::days(7))?));
    }
    if text.contains("this week") {
        return Some((monday, monday.checked_add_signed(Duration::days(7))?));
    }
    None
}

fn part_of_day(text: &str) -> Option<(u32, u32)> {
    if text.contains("morning") {
        Some((8, 12))
    } else if text.contains("afternoon") {
        Some((12, 18))
    } else if text.contains("evening") || text.contains("tonight") {
        Some((18, 23))
    } else {
        None
    }
}

fn weekday(name: &str) -> Option<Weekday> {
    match name {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

fn clock(
    hour: &str,
    minute: Option<regex::Match<'_>>,
    meridiem: Option<regex::Match<'_>>,
) -> Option<NaiveTime> {
    let mut hour: u32 = hour.parse().ok()?;
    let minute: u32 = match minute {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    match meridiem.map(|m| m.as_str()) {
        Some("pm") if hour < 12 => hour += 12,
        Some("am") if hour == 12 => hour = 0,
        _ => {}
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
}

fn at(tz: FixedOffset, day: NaiveDate, hour: u32, minute: u32) -> Option<String> {
    let naive = day.and_time(NaiveTime::from_hms_opt(hour, minute, 0)?);
    tz.from_local_datetime(&naive)
        .single()
        .map(|dt| format_timestamp(&dt))
}
