//! Stable keys for scraped records
//!
//! A key must not depend on when the record was observed: the same event
//! seen on two different days maps to the same key.

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use thiserror::Error;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use super::snapshot::EventRecord;

/// Maps a record to its identity key
pub trait KeyDeriver<R>: Send + Sync {
    fn derive_key(&self, record: &R) -> Result<String, KeyError>;
}

impl<R, F> KeyDeriver<R> for F
where
    F: Fn(&R) -> Result<String, KeyError> + Send + Sync,
{
    fn derive_key(&self, record: &R) -> Result<String, KeyError> {
        self(record)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("unrecognised date '{0}'")]
    InvalidDate(String),

    #[error("unrecognised start time '{0}'")]
    InvalidTime(String),

    #[error("title '{0}' has no characters usable in a key")]
    EmptySlug(String),
}

const DATED_FORMATS: &[&str] = &["%b %d %Y", "%B %d %Y", "%b %d, %Y", "%B %d, %Y", "%Y-%m-%d"];
const YEARLESS_FORMATS: &[&str] = &["%b %d %Y", "%B %d %Y"];
const TIME_FORMATS: &[&str] = &["%I:%M %p", "%I:%M%p", "%H:%M"];

/// `slug(title)-YYYYMMDD-HHMM`
///
/// Dates without a year are placed on or after `reference_date`, which the
/// caller fixes once per process so that keys never depend on the wall clock
/// at the moment a record is keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventKeyDeriver {
    reference_date: NaiveDate,
}

impl EventKeyDeriver {
    pub fn new(reference_date: NaiveDate) -> Self {
        Self { reference_date }
    }

    pub fn reference_date(&self) -> NaiveDate {
        self.reference_date
    }

    /// Accepts `"Saturday, Mar 15 2025"` and year-less `"Saturday, Mar 15"`
    pub fn parse_date(&self, raw: &str) -> Result<NaiveDate, KeyError> {
        let body = strip_weekday(raw.trim());

        for format in DATED_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(body, format) {
                return Ok(date);
            }
        }

        let this_year = self.reference_date.year();
        for format in YEARLESS_FORMATS {
            let Ok(candidate) = NaiveDate::parse_from_str(&format!("{} {}", body, this_year), format)
            else {
                // Feb 29 only parses in leap years; retry with the next one
                if let Some(date) = self.next_leap_day(body, format) {
                    return Ok(date);
                }
                continue;
            };
            if candidate >= self.reference_date {
                return Ok(candidate);
            }
            return NaiveDate::from_ymd_opt(this_year + 1, candidate.month(), candidate.day())
                .or_else(|| self.next_leap_day(body, format))
                .ok_or_else(|| KeyError::InvalidDate(raw.to_string()));
        }

        Err(KeyError::InvalidDate(raw.to_string()))
    }

    fn next_leap_day(&self, body: &str, format: &str) -> Option<NaiveDate> {
        let start = self.reference_date.year();
        (start..start + 8)
            .filter_map(|year| NaiveDate::parse_from_str(&format!("{} {}", body, year), format).ok())
            .find(|date| *date >= self.reference_date)
    }
}

/// Start of a `"7:00 PM - 9:00 PM"` range; `"7 PM"` and `"19:00"` also work
pub fn parse_start_time(raw: &str) -> Result<NaiveTime, KeyError> {
    let start = raw.split(['-', '–']).next().unwrap_or("").trim().to_uppercase();

    // "7 PM" -> "7:00 PM"
    let digits_end = start
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(start.len());
    let normalized = if digits_end > 0 && !start.contains(':') {
        format!("{}:00{}", &start[..digits_end], &start[digits_end..])
    } else {
        start
    };

    TIME_FORMATS
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(&normalized, format).ok())
        .ok_or_else(|| KeyError::InvalidTime(raw.to_string()))
}

fn strip_weekday(raw: &str) -> &str {
    match raw.split_once(',') {
        Some((weekday, rest)) if weekday.trim().parse::<Weekday>().is_ok() => rest.trim(),
        _ => raw,
    }
}

/// NFKD-fold to ASCII, lowercase, collapse everything else to single dashes
///
/// Accents and letters with no ASCII form are dropped; punctuation of any
/// script, apostrophes included, separates words.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;

    for c in text.nfkd() {
        if !c.is_ascii() && (is_combining_mark(c) || c.is_alphanumeric()) {
            continue;
        }
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    slug
}

impl KeyDeriver<EventRecord> for EventKeyDeriver {
    fn derive_key(&self, record: &EventRecord) -> Result<String, KeyError> {
        if record.title.trim().is_empty() {
            return Err(KeyError::MissingField("title"));
        }
        if record.date.trim().is_empty() {
            return Err(KeyError::MissingField("date"));
        }
        if record.time.trim().is_empty() {
            return Err(KeyError::MissingField("time"));
        }

        let slug = slugify(&record.title);
        if slug.is_empty() {
            return Err(KeyError::EmptySlug(record.title.clone()));
        }
        let date = self.parse_date(&record.date)?;
        let start = parse_start_time(&record.time)?;

        Ok(format!(
            "{}-{}-{}",
            slug,
            date.format("%Y%m%d"),
            start.format("%H%M")
        ))
    }
}
