//! Five-field cron evaluation.
//!
//! Supports the subset the scheduler accepts: literal integers, `*`, and
//! `*/step`. Ranges, lists, and names are rejected at parse time so a bad
//! expression is caught when the schedule is created, not when it fires.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),
    #[error("unsupported expression in field `{0}`")]
    Unsupported(String),
    #[error("value {value} out of range for {field} ({min}-{max})")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("no matching time within the search horizon")]
    Unsatisfiable,
}

/// One parsed cron field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CronField {
    Any,
    Step(u32),
    Literal(u32),
}

impl CronField {
    fn matches(&self, value: u32, base: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Step(step) => (value - base) % step == 0,
            CronField::Literal(v) => *v == value,
        }
    }
}

/// A parsed five-field schedule: minute, hour, day-of-month, month,
/// day-of-week (0 = Sunday).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: CronField,
    hour: CronField,
    dom: CronField,
    month: CronField,
    dow: CronField,
}

// Matching beyond this many minutes means the expression cannot fire (e.g.
// dom 30 in February); well past the longest legitimate gap.
const SEARCH_HORIZON_MINUTES: i64 = 5 * 366 * 24 * 60;

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        Ok(Self {
            minute: parse_field(fields[0], "minute", 0, 59)?,
            hour: parse_field(fields[1], "hour", 0, 23)?,
            dom: parse_field(fields[2], "day-of-month", 1, 31)?,
            month: parse_field(fields[3], "month", 1, 12)?,
            dow: parse_field(fields[4], "day-of-week", 0, 6)?,
        })
    }

    /// Whether the schedule fires at the given instant (minute resolution).
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minute.matches(at.minute(), 0)
            && self.hour.matches(at.hour(), 0)
            && self.dom.matches(at.day(), 1)
            && self.month.matches(at.month(), 1)
            && self.dow.matches(at.weekday().num_days_from_sunday(), 0)
    }

    /// Next firing time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        let mut candidate = (now + Duration::minutes(1))
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .expect("second/nanosecond 0 is always valid");

        for _ in 0..SEARCH_HORIZON_MINUTES {
            if self.matches(candidate) {
                return Ok(candidate);
            }
            candidate += Duration::minutes(1);
        }

        Err(CronError::Unsatisfiable)
    }
}

fn parse_field(
    raw: &str,
    name: &'static str,
    min: u32,
    max: u32,
) -> Result<CronField, CronError> {
    if raw == "*" {
        return Ok(CronField::Any);
    }

    if let Some(step) = raw.strip_prefix("*/") {
        let step: u32 = step
            .parse()
            .map_err(|_| CronError::Unsupported(raw.to_string()))?;
        if step == 0 || step > max {
            return Err(CronError::OutOfRange {
                field: name,
                value: step,
                min: 1,
                max,
            });
        }
        return Ok(CronField::Step(step));
    }

    let value: u32 = raw
        .parse()
        .map_err(|_| CronError::Unsupported(raw.to_string()))?;
    if value < min || value > max {
        return Err(CronError::OutOfRange {
            field: name,
            value,
            min,
            max,
        });
    }
    Ok(CronField::Literal(value))
}

/// Validate an expression without keeping the parse.
pub fn validate_cron(expr: &str) -> bool {
    CronSchedule::parse(expr).is_ok()
}
