//! Time parsing for the `time` and `ival` types. Values are epoch milliseconds.

use time::macros::format_description;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

/// Sentinel for an open-ended interval maximum (`?`).
pub const TIME_MAX: i64 = i64::MAX;

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Parses `now`, `YYYY`, `YYYY-MM`, `YYYY-MM-DD`, `YYYY-MM-DD HH:MM` and
/// `YYYY-MM-DD HH:MM:SS` (UTC), or a bare integer of epoch milliseconds with more
/// than eight digits.
pub fn parse_time(text: &str) -> Option<i64> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("now") {
        return Some(now_millis());
    }
    if text.len() > 8 && text.bytes().all(|b| b.is_ascii_digit()) {
        return text.parse().ok();
    }
    let (date, clock) = match text.split_once(|c: char| c == ' ' || c == 'T') {
        Some((date, clock)) => (date, Some(clock)),
        None => (text, None),
    };
    let date = parse_date(date)?;
    let clock = match clock {
        None => Time::MIDNIGHT,
        Some(clock) => parse_clock(clock)?,
    };
    let stamp = PrimitiveDateTime::new(date, clock).assume_utc();
    Some((stamp.unix_timestamp_nanos() / 1_000_000) as i64)
}

fn parse_date(text: &str) -> Option<Date> {
    let mut parts = text.split('-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month = match parts.next() {
        Some(month) => Month::try_from(month.parse::<u8>().ok()?).ok()?,
        None => Month::January,
    };
    let day = match parts.next() {
        Some(day) => day.parse::<u8>().ok()?,
        None => 1,
    };
    if parts.next().is_some() {
        return None;
    }
    Date::from_calendar_date(year, month, day).ok()
}

fn parse_clock(text: &str) -> Option<Time> {
    let long = format_description!("[hour]:[minute]:[second]");
    let short = format_description!("[hour]:[minute]");
    Time::parse(text, long)
        .or_else(|_| Time::parse(text, short))
        .ok()
}
