// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cron expression parsing and schedule records.
//!
//! Five space-separated fields: minute, hour, day-of-month, month,
//! day-of-week. Per-field grammar: `*`, `N`, `N-M`, `*/N`, `N/M`, and
//! comma-separated lists of those. Day-of-week follows cron convention
//! (0 = Sunday … 6 = Saturday); `7` is accepted and normalised to `0`.
//!
//! Matching converts the instant into the schedule's timezone and evaluates
//! each field independently. Next-run computation steps forward one minute
//! at a time, bounded at roughly one year.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Persisted schedule and run records.
pub mod schedule;

pub use schedule::{CronRun, CronRunOutcome, CronSchedule, ScheduleStatus};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Upper bound for the forward next-run search: about one year of minutes.
const SEARCH_LIMIT_MINUTES: i64 = 366 * 24 * 60;

/// Errors from cron expression parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronParseError {
    /// The expression does not have exactly five fields.
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),

    /// A field term could not be parsed.
    #[error("invalid term '{term}' in {field} field")]
    BadTerm {
        /// Field name (`minute`, `hour`, …).
        field: &'static str,
        /// The offending term.
        term: String,
    },

    /// A value lies outside the field's range.
    #[error("value {value} out of range {min}-{max} for {field} field")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// The offending value.
        value: u32,
        /// Minimum allowed.
        min: u32,
        /// Maximum allowed.
        max: u32,
    },

    /// A range term runs backwards (`30-10`).
    #[error("inverted range '{term}' in {field} field")]
    InvertedRange {
        /// Field name.
        field: &'static str,
        /// The offending term.
        term: String,
    },

    /// A step of zero (`*/0`).
    #[error("zero step in {field} field")]
    ZeroStep {
        /// Field name.
        field: &'static str,
    },
}

// ---------------------------------------------------------------------------
// Field parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12 };
// Accept 7 in the raw field; values are normalised to 0-6 after parsing.
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7 };

fn parse_field(spec: FieldSpec, text: &str) -> Result<BTreeSet<u32>, CronParseError> {
    let mut values = BTreeSet::new();
    for term in text.split(',') {
        parse_term(spec, term, &mut values)?;
    }
    if values.is_empty() {
        return Err(CronParseError::BadTerm {
            field: spec.name,
            term: text.to_string(),
        });
    }
    Ok(values)
}

fn parse_term(
    spec: FieldSpec,
    term: &str,
    out: &mut BTreeSet<u32>,
) -> Result<(), CronParseError> {
    let bad = || CronParseError::BadTerm {
        field: spec.name,
        term: term.to_string(),
    };

    // `*` and `*/N`
    if let Some(rest) = term.strip_prefix('*') {
        let step = match rest {
            "" => 1,
            _ => {
                let step_text = rest.strip_prefix('/').ok_or_else(bad)?;
                step_text.parse::<u32>().map_err(|_| bad())?
            }
        };
        if step == 0 {
            return Err(CronParseError::ZeroStep { field: spec.name });
        }
        let mut v = spec.min;
        while v <= spec.max {
            out.insert(v);
            v += step;
        }
        return Ok(());
    }

    // `N/M`: start at N, step M through the field maximum.
    if let Some((start_text, step_text)) = term.split_once('/') {
        if start_text.contains('-') {
            return Err(bad());
        }
        let start = parse_value(spec, start_text, term)?;
        let step = step_text.parse::<u32>().map_err(|_| bad())?;
        if step == 0 {
            return Err(CronParseError::ZeroStep { field: spec.name });
        }
        let mut v = start;
        while v <= spec.max {
            out.insert(v);
            v += step;
        }
        return Ok(());
    }

    // `N-M`
    if let Some((lo_text, hi_text)) = term.split_once('-') {
        let lo = parse_value(spec, lo_text, term)?;
        let hi = parse_value(spec, hi_text, term)?;
        if lo > hi {
            return Err(CronParseError::InvertedRange {
                field: spec.name,
                term: term.to_string(),
            });
        }
        out.extend(lo..=hi);
        return Ok(());
    }

    // Plain `N`
    out.insert(parse_value(spec, term, term)?);
    Ok(())
}

fn parse_value(spec: FieldSpec, text: &str, term: &str) -> Result<u32, CronParseError> {
    let value = text.parse::<u32>().map_err(|_| CronParseError::BadTerm {
        field: spec.name,
        term: term.to_string(),
    })?;
    if value < spec.min || value > spec.max {
        return Err(CronParseError::OutOfRange {
            field: spec.name,
            value,
            min: spec.min,
            max: spec.max,
        });
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// CronExpr
// ---------------------------------------------------------------------------

/// A parsed five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    days_of_week: BTreeSet<u32>,
    source: String,
}

impl CronExpr {
    /// Parse a five-field expression.
    ///
    /// # Errors
    ///
    /// Returns a [`CronParseError`] describing the first malformed field.
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError::FieldCount(fields.len()));
        }
        let days_of_week_raw = parse_field(DAY_OF_WEEK, fields[4])?;
        // Normalise 7 (Java-style Sunday) to 0 (cron-style Sunday).
        let days_of_week = days_of_week_raw
            .into_iter()
            .map(|d| if d == 7 { 0 } else { d })
            .collect();
        Ok(Self {
            minutes: parse_field(MINUTE, fields[0])?,
            hours: parse_field(HOUR, fields[1])?,
            days_of_month: parse_field(DAY_OF_MONTH, fields[2])?,
            months: parse_field(MONTH, fields[3])?,
            days_of_week,
            source: expression.to_string(),
        })
    }

    /// The original expression text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the instant (in the given timezone) matches every field.
    ///
    /// Seconds are ignored; matching is minute-granular. Day-of-week uses
    /// Sunday-as-0.
    #[must_use]
    pub fn matches(&self, at: DateTime<Utc>, tz: Tz) -> bool {
        let local = at.with_timezone(&tz);
        self.minutes.contains(&local.minute())
            && self.hours.contains(&local.hour())
            && self.days_of_month.contains(&local.day())
            && self.months.contains(&local.month())
            && self
                .days_of_week
                .contains(&local.weekday().num_days_from_sunday())
    }

    /// The first matching instant strictly after `from`, minute-granular.
    ///
    /// Steps forward one minute at a time; returns `None` when no match is
    /// found within about one year.
    #[must_use]
    pub fn next_after(&self, from: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        // Truncate to the minute, then step.
        let mut candidate = Utc
            .with_ymd_and_hms(
                from.year(),
                from.month(),
                from.day(),
                from.hour(),
                from.minute(),
                0,
            )
            .single()?;
        for _ in 0..SEARCH_LIMIT_MINUTES {
            candidate += ChronoDuration::minutes(1);
            if self.matches(candidate, tz) {
                return Some(candidate);
            }
        }
        None
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
