//! Lenient date normalization for field sheets: several human notations in, `YYYY-MM-DD` out.

use regex::Regex;
use std::sync::OnceLock;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, Month};

/// Canonical calendar notation produced by [`normalize_date`].
pub const CANONICAL: &[FormatItem<'_>] = format_description!("[year]-[month]-[day]");

// `May 4, 2023`, `Sep 04, 2023`, `4 May 2023`.
const MONTH_NAMED: [&[FormatItem<'_>]; 4] = [
    format_description!("[month repr:long case_sensitive:false] [day padding:none], [year]"),
    format_description!("[month repr:short case_sensitive:false] [day padding:none], [year]"),
    format_description!("[day padding:none] [month repr:short case_sensitive:false] [year]"),
    format_description!("[day padding:none] [month repr:long case_sensitive:false] [year]"),
];

fn year_first() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})$").expect("static regex"))
}

fn year_last() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,2})[-/.](\d{1,2})[-/.](\d{2}|\d{4})$").expect("static regex"))
}

/// A date followed by a clock time: ` 10:30`, `T10:30:00.250Z`, ` 10:30:00+02:00`.
fn with_clock() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\S+)[T ]([01]?\d|2[0-3]):[0-5]\d(?::[0-5]\d(?:\.\d{1,9})?)?\s*(?:Z|[+-]\d{2}:?\d{2})?$")
            .expect("static regex")
    })
}

fn expand_year(raw: &str) -> Option<i32> {
    let y: i32 = raw.parse().ok()?;
    Some(match raw.len() {
        2 if y < 50 => 2000 + y,
        2 => 1900 + y,
        _ => y,
    })
}

fn build(year: i32, month: u32, day: u32) -> Option<Date> {
    let month = Month::try_from(u8::try_from(month).ok()?).ok()?;
    Date::from_calendar_date(year, month, u8::try_from(day).ok()?).ok()
}

/// Parse `raw` as a calendar date.
///
/// Accepts `YYYY-M-D` and `D-M-YYYY` / `D-M-YY` with `-`, `/` or `.` separators, the same
/// followed by a clock time (the time is dropped), and month names (`May 4, 2023`, `4 May 2023`).
/// When the first two parts of a year-last value are both `<= 12`, `day_first` decides
/// which one is the day; otherwise the part above 12 must be the day.
/// Two-digit years below 50 land in the 2000s, the rest in the 1900s.
pub fn parse_flexible(raw: &str, day_first: bool) -> Option<Date> {
    let s = raw.trim();
    if let Some(c) = with_clock().captures(s) {
        return parse_numeric(c.get(1)?.as_str(), day_first);
    }
    if let Some(d) = parse_numeric(s, day_first) {
        return Some(d);
    }
    MONTH_NAMED.iter().find_map(|f| Date::parse(s, f).ok())
}

fn parse_numeric(s: &str, day_first: bool) -> Option<Date> {
    if let Some(c) = year_first().captures(s) {
        return build(c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?);
    }
    let c = year_last().captures(s)?;
    let a: u32 = c[1].parse().ok()?;
    let b: u32 = c[2].parse().ok()?;
    let year = expand_year(&c[3])?;
    let (day, month) = if a > 12 {
        (a, b)
    } else if b > 12 {
        (b, a)
    } else if day_first {
        (a, b)
    } else {
        (b, a)
    };
    build(year, month, day)
}

/// Normalize to `YYYY-MM-DD`, or hand the input back untouched when no notation matches.
/// Rejecting bad dates is left to the store.
pub fn normalize_date(raw: &str, day_first: bool) -> String {
    parse_flexible(raw, day_first)
        .and_then(|d| d.format(CANONICAL).ok())
        .unwrap_or_else(|| raw.to_string())
}

/// Parse a canonical `YYYY-MM-DD` value (used when summarizing materialized rows).
pub fn parse_canonical(s: &str) -> Option<Date> {
    Date::parse(s, CANONICAL).ok()
}
