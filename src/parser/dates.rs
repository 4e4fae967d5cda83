//! Date normalization for bank notification timestamps.
//!
//! Accepted shapes:
//! - `15 diciembre 2024 - 10:30 a.m.` (Spanish or English month names, full or abbreviated)
//! - `15/12/2024 10:30 PM` (day first, optional AM/PM)
//! - `2024-12-15 10:30`
//!
//! Anything else passes through untouched as `NormalizedDate::Raw`.

use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use regex::Regex;

static ISO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4})-(\d{1,2})-(\d{1,2})[T\s]+(\d{1,2}):(\d{2})").expect("static regex")
});
static DAY_FIRST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d{1,2})/(\d{1,2})/(\d{4})(?:\s+(\d{1,2}):(\d{2})\s*(a\.?\s?m\.?|p\.?\s?m\.?)?)?")
        .expect("static regex")
});
static LONG_MONTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\d{1,2})\s+(?:de\s+)?(\p{L}+)\.?\s+(?:de\s+)?(\d{4})\s*[-,]?\s*(\d{1,2}):(\d{2})\s*(a\.?\s?m\.?|p\.?\s?m\.?)?",
    )
    .expect("static regex")
});

/// Result of date normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedDate {
    Parsed(NaiveDateTime),
    /// Unrecognized input, kept verbatim.
    Raw(String),
}

impl NormalizedDate {
    pub fn parsed(&self) -> Option<NaiveDateTime> {
        match self {
            NormalizedDate::Parsed(dt) => Some(*dt),
            NormalizedDate::Raw(_) => None,
        }
    }

    /// `YYYY-MM-DDTHH:MM:SS` when parsed, the raw text otherwise.
    pub fn to_storage_string(&self) -> String {
        match self {
            NormalizedDate::Parsed(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
            NormalizedDate::Raw(raw) => raw.clone(),
        }
    }
}

/// Formats banks use in notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateFormat {
    /// `15 diciembre 2024 - 10:30 a.m.`
    LongMonth,
    /// `15/12/2024 10:30 AM`
    DayFirst,
    /// `2024-12-15 10:30`
    Iso,
}

impl DateFormat {
    pub const ALL: [DateFormat; 3] = [DateFormat::LongMonth, DateFormat::DayFirst, DateFormat::Iso];

    /// Render a timestamp the way a bank would print it.
    pub fn render(&self, dt: &NaiveDateTime) -> String {
        let (is_pm, hour12) = dt.hour12();
        match self {
            DateFormat::LongMonth => format!(
                "{} {} {} - {}:{:02} {}",
                dt.format("%-d"),
                SPANISH_MONTHS[dt.month0() as usize],
                dt.format("%Y"),
                hour12,
                dt.minute(),
                if is_pm { "p.m." } else { "a.m." }
            ),
            DateFormat::DayFirst => format!(
                "{} {}:{:02} {}",
                dt.format("%d/%m/%Y"),
                hour12,
                dt.minute(),
                if is_pm { "PM" } else { "AM" }
            ),
            DateFormat::Iso => dt.format("%Y-%m-%d %H:%M").to_string(),
        }
    }
}

const SPANISH_MONTHS: [&str; 12] = [
    "enero",
    "febrero",
    "marzo",
    "abril",
    "mayo",
    "junio",
    "julio",
    "agosto",
    "septiembre",
    "octubre",
    "noviembre",
    "diciembre",
];

fn month_number(name: &str) -> Option<u32> {
    let name = name.to_lowercase();
    let month = match name.as_str() {
        "enero" | "ene" | "january" | "jan" => 1,
        "febrero" | "feb" | "february" => 2,
        "marzo" | "mar" | "march" => 3,
        "abril" | "abr" | "april" | "apr" => 4,
        "mayo" | "may" => 5,
        "junio" | "jun" | "june" => 6,
        "julio" | "jul" | "july" => 7,
        "agosto" | "ago" | "august" | "aug" => 8,
        "septiembre" | "setiembre" | "sep" | "set" | "sept" | "september" => 9,
        "octubre" | "oct" | "october" => 10,
        "noviembre" | "nov" | "november" => 11,
        "diciembre" | "dic" | "december" | "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// Apply an optional am/pm marker to a 12-hour clock value.
fn to_24h(hour: u32, marker: Option<&str>) -> u32 {
    match marker.map(|m| m.to_lowercase()) {
        Some(m) if m.starts_with('p') && hour < 12 => hour + 12,
        Some(m) if m.starts_with('a') && hour == 12 => 0,
        _ => hour,
    }
}

fn build(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)
}

fn num<T: std::str::FromStr>(caps: &regex::Captures<'_>, i: usize) -> Option<T> {
    caps.get(i)?.as_str().parse().ok()
}

/// Normalize a date string found in a notification.
pub fn normalize_date(raw: &str) -> NormalizedDate {
    let parsed = ISO
        .captures(raw)
        .and_then(|c| build(num(&c, 1)?, num(&c, 2)?, num(&c, 3)?, num(&c, 4)?, num(&c, 5)?))
        .or_else(|| {
            let c = DAY_FIRST.captures(raw)?;
            let hour: u32 = num(&c, 4).unwrap_or(0);
            let minute: u32 = num(&c, 5).unwrap_or(0);
            let hour = to_24h(hour, c.get(6).map(|m| m.as_str()));
            build(num(&c, 3)?, num(&c, 2)?, num(&c, 1)?, hour, minute)
        })
        .or_else(|| {
            let c = LONG_MONTH.captures(raw)?;
            let month = month_number(c.get(2)?.as_str())?;
            let hour = to_24h(num(&c, 4)?, c.get(6).map(|m| m.as_str()));
            build(num(&c, 3)?, month, num(&c, 1)?, hour, num(&c, 5)?)
        });

    match parsed {
        Some(dt) => NormalizedDate::Parsed(dt),
        None => NormalizedDate::Raw(raw.to_string()),
    }
}
