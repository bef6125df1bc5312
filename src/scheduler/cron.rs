//! Trigger evaluator: 5-field cron expressions and next-fire computation.
//!
//! Fields are `minute hour day-of-month month day-of-week`, all evaluated in UTC.
//! Each field accepts `*`, single values, ranges `A-B`, lists `a,b,c` and steps
//! (`*/S`, `A-B/S`, `N/S`). Day-of-week runs 0-7 with both 0 and 7 meaning Sunday.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};

use crate::error::EngineError;

/// How far ahead `next_after` searches before concluding nothing matches.
/// Eight years always contains a Feb 29, even across 2100.
const SEARCH_HORIZON_YEARS: i32 = 8;

/// A parsed cron schedule. Each field is stored as a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12 };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7 };

impl CronSchedule {
    /// Parse a 5-field expression. Rejects anything else, including
    /// expressions that can never fire (e.g. `0 0 30 2 *`).
    pub fn parse(expr: &str) -> Result<Self, EngineError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(EngineError::invalid_schedule(
                expr,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let bad = |reason: String| EngineError::invalid_schedule(expr, reason);

        let minutes = parse_field(fields[0], &MINUTE).map_err(bad)?;
        let hours = parse_field(fields[1], &HOUR).map_err(bad)?;
        let days_of_month = parse_field(fields[2], &DAY_OF_MONTH).map_err(bad)?;
        let months = parse_field(fields[3], &MONTH).map_err(bad)?;
        let mut days_of_week = parse_field(fields[4], &DAY_OF_WEEK).map_err(bad)?;

        // 7 is an alias for Sunday.
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        let schedule = Self {
            expr: fields.join(" "),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        };

        let origin = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).single();
        if origin.and_then(|p| schedule.next_after(p)).is_none() {
            return Err(EngineError::invalid_schedule(expr, "expression never fires"));
        }

        Ok(schedule)
    }

    /// The normalized expression (fields separated by single spaces).
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Next fire time strictly after `after`, or `None` when nothing matches
    /// within the search horizon.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.naive_utc().with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit_year = start.year() + SEARCH_HORIZON_YEARS;

        let mut t = start;
        while t.year() <= limit_year {
            if !bit(self.months, t.month()) {
                t = first_of_next_month(t.date())?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(Utc.from_utc_datetime(&t));
        }
        None
    }

    /// Iterate over fire times strictly after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>) -> Upcoming<'_> {
        Upcoming { schedule: self, cursor: Some(after) }
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        // Classic cron rule: when both day fields are restricted, either may match.
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronSchedule {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

pub struct Upcoming<'a> {
    schedule: &'a CronSchedule,
    cursor: Option<DateTime<Utc>>,
}

impl Iterator for Upcoming<'_> {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.schedule.next_after(self.cursor?);
        self.cursor = next;
        next
    }
}

/// Parse `expr` and return its next fire time strictly after `after`.
pub fn next_fire(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, EngineError> {
    let schedule = CronSchedule::parse(expr)?;
    schedule
        .next_after(after)
        .ok_or_else(|| EngineError::invalid_schedule(expr, "no fire time within search horizon"))
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn parse_field(field: &str, spec: &FieldSpec) -> Result<u64, String> {
    let mut mask = 0u64;
    for part in field.split(',') {
        if part.is_empty() {
            return Err(format!("empty list item in {} field '{}'", spec.name, field));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = parse_number(step, spec)?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field '{}'", spec.name, field));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (parse_value(a, spec)?, parse_value(b, spec)?);
            if a > b {
                return Err(format!("reversed range {}-{} in {} field", a, b, spec.name));
            }
            (a, b)
        } else {
            let v = parse_value(range, spec)?;
            // `N/S` means "from N to the end of the range, every S".
            if step.is_some() {
                (v, spec.max)
            } else {
                (v, v)
            }
        };

        let step = step.unwrap_or(1) as usize;
        for v in (lo..=hi).step_by(step) {
            mask |= 1u64 << v;
        }
    }
    Ok(mask)
}

fn parse_number(s: &str, spec: &FieldSpec) -> Result<u32, String> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("unsupported token '{}' in {} field", s, spec.name));
    }
    s.parse::<u32>()
        .map_err(|_| format!("number '{}' too large in {} field", s, spec.name))
}

fn parse_value(s: &str, spec: &FieldSpec) -> Result<u32, String> {
    let v = parse_number(s, spec)?;
    if v < spec.min || v > spec.max {
        return Err(format!(
            "{} value {} out of range {}-{}",
            spec.name, v, spec.min, spec.max
        ));
    }
    Ok(v)
}
