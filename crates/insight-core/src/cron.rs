//! Five-field cron expressions
//!
//! `minute hour day-of-month month day-of-week`, day-of-week 0 = Sunday.
//! Each field accepts `*`, a single value, an inclusive range `a-b`,
//! a step `*/n` (value mod n == 0) and comma-separated lists of those.
//!
//! Next-run computation walks forward minute by minute from the start of the
//! next minute until every field matches, giving up after one year.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

/// Minutes searched before giving up (366 days)
const SEARCH_HORIZON_MINUTES: i64 = 366 * 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("Invalid cron format '{0}', expected 5 fields: minute hour day month weekday")]
    FieldCount(String),
    #[error("Invalid {field} field '{value}' in cron expression")]
    InvalidField { field: &'static str, value: String },
    #[error("No valid execution time found in the next year for: {0}")]
    NoMatch(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldSpec {
    Any,
    Value(u32),
    Range(u32, u32),
    Step(u32),
    List(Vec<FieldSpec>),
}

impl FieldSpec {
    fn parse(token: &str, name: &'static str, min: u32, max: u32) -> Result<Self, CronError> {
        let invalid = || CronError::InvalidField {
            field: name,
            value: token.to_string(),
        };

        if token.contains(',') {
            let parts = token
                .split(',')
                .map(|part| Self::parse(part.trim(), name, min, max))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(FieldSpec::List(parts));
        }

        if token == "*" {
            return Ok(FieldSpec::Any);
        }

        if let Some(step) = token.strip_prefix("*/") {
            let n: u32 = step.parse().map_err(|_| invalid())?;
            if n == 0 {
                return Err(invalid());
            }
            return Ok(FieldSpec::Step(n));
        }

        let in_bounds = |v: u32| v >= min && v <= max;

        if let Some((start, end)) = token.split_once('-') {
            let start: u32 = start.trim().parse().map_err(|_| invalid())?;
            let end: u32 = end.trim().parse().map_err(|_| invalid())?;
            if !in_bounds(start) || !in_bounds(end) || start > end {
                return Err(invalid());
            }
            return Ok(FieldSpec::Range(start, end));
        }

        let value: u32 = token.parse().map_err(|_| invalid())?;
        if !in_bounds(value) {
            return Err(invalid());
        }
        Ok(FieldSpec::Value(value))
    }

    fn matches(&self, value: u32) -> bool {
        match self {
            FieldSpec::Any => true,
            FieldSpec::Value(v) => value == *v,
            FieldSpec::Range(start, end) => value >= *start && value <= *end,
            FieldSpec::Step(n) => value % n == 0,
            FieldSpec::List(parts) => parts.iter().any(|p| p.matches(value)),
        }
    }
}

/// A parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minute: FieldSpec,
    hour: FieldSpec,
    day_of_month: FieldSpec,
    month: FieldSpec,
    day_of_week: FieldSpec,
}

impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::FieldCount(s.to_string()));
        }

        Ok(Self {
            source: s.trim().to_string(),
            minute: FieldSpec::parse(parts[0], "minute", 0, 59)?,
            hour: FieldSpec::parse(parts[1], "hour", 0, 23)?,
            day_of_month: FieldSpec::parse(parts[2], "day-of-month", 1, 31)?,
            month: FieldSpec::parse(parts[3], "month", 1, 12)?,
            day_of_week: FieldSpec::parse(parts[4], "day-of-week", 0, 6)?,
        })
    }
}

impl CronExpression {
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether a wall-clock time matches all five fields
    pub fn matches<T: TimeZone>(&self, time: &DateTime<T>) -> bool {
        self.minute.matches(time.minute())
            && self.hour.matches(time.hour())
            && self.day_of_month.matches(time.day())
            && self.month.matches(time.month())
            && self.day_of_week.matches(time.weekday().num_days_from_sunday())
    }

    /// First matching minute strictly after `after`, evaluated in `tz`
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>, CronError> {
        let truncated = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after);
        let mut candidate = truncated + Duration::minutes(1);

        for _ in 0..SEARCH_HORIZON_MINUTES {
            if self.matches(&candidate.with_timezone(&tz)) {
                return Ok(candidate);
            }
            candidate += Duration::minutes(1);
        }

        Err(CronError::NoMatch(self.source.clone()))
    }
}

/// Parse and validate a cron expression
pub fn parse_cron(expression: &str) -> Result<CronExpression, CronError> {
    expression.parse()
}

/// Next run time (epoch millis) after `now_ms` for a cron expression
pub fn next_run_after(expression: &str, now_ms: i64, tz: Tz) -> Result<i64, CronError> {
    let schedule = parse_cron(expression)?;
    let now = DateTime::<Utc>::from_timestamp_millis(now_ms).unwrap_or_else(Utc::now);
    Ok(schedule.next_after(now, tz)?.timestamp_millis())
}
