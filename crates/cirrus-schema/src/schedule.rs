//! Time-based invocation schedules: `rate(<n> <unit>)` and six-field `cron(...)`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("schedule must be 'rate(...)' or 'cron(...)', got '{0}'")]
    UnknownForm(String),
    #[error("invalid rate expression '{0}': expected 'rate(<n> <minutes|hours|days>)'")]
    InvalidRate(String),
    #[error("rate value must be positive: '{0}'")]
    ZeroRate(String),
    #[error("cron expression '{expr}' has {found} fields, expected 6")]
    CronFieldCount { expr: String, found: usize },
    #[error("cron field '{field}' contains unsupported characters")]
    CronField { field: String },
    #[error("cron expression '{0}' must use '?' in exactly one of day-of-month and day-of-week")]
    CronDayConflict(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RateUnit {
    Minutes,
    Hours,
    Days,
}

impl RateUnit {
    fn seconds(self) -> u64 {
        match self {
            RateUnit::Minutes => 60,
            RateUnit::Hours => 3_600,
            RateUnit::Days => 86_400,
        }
    }

    fn label(self, count: u64) -> &'static str {
        match (self, count == 1) {
            (RateUnit::Minutes, true) => "minute",
            (RateUnit::Minutes, false) => "minutes",
            (RateUnit::Hours, true) => "hour",
            (RateUnit::Hours, false) => "hours",
            (RateUnit::Days, true) => "day",
            (RateUnit::Days, false) => "days",
        }
    }
}

/// A fixed-rate interval or a cron-like specification.
///
/// Serialized as its canonical expression string, so `rate(1 hours)` and
/// `rate(1 hour)` hash identically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Schedule {
    Rate { every: u64, unit: RateUnit },
    Cron(String),
}

impl Schedule {
    pub fn parse(input: &str) -> Result<Self, ScheduleError> {
        let trimmed = input.trim();
        if let Some(body) = strip_call(trimmed, "rate") {
            return parse_rate(trimmed, body);
        }
        if let Some(body) = strip_call(trimmed, "cron") {
            return parse_cron(body);
        }
        Err(ScheduleError::UnknownForm(trimmed.to_owned()))
    }

    pub fn rate(every: u64, unit: RateUnit) -> Self {
        Schedule::Rate { every, unit }
    }

    /// Interval between invocations for rate schedules. `None` for cron
    /// schedules and for rates too long to represent in seconds.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            Schedule::Rate { every, unit } => {
                every.checked_mul(unit.seconds()).map(Duration::from_secs)
            }
            Schedule::Cron(_) => None,
        }
    }
}

fn strip_call<'a>(input: &'a str, name: &str) -> Option<&'a str> {
    input
        .strip_prefix(name)
        .and_then(|rest| rest.trim_start().strip_prefix('('))
        .and_then(|rest| rest.strip_suffix(')'))
        .map(str::trim)
}

fn parse_rate(raw: &str, body: &str) -> Result<Schedule, ScheduleError> {
    let mut parts = body.split_whitespace();
    let (Some(value), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ScheduleError::InvalidRate(raw.to_owned()));
    };
    let every: u64 = value
        .parse()
        .map_err(|_| ScheduleError::InvalidRate(raw.to_owned()))?;
    if every == 0 {
        return Err(ScheduleError::ZeroRate(raw.to_owned()));
    }
    let unit = match unit.to_ascii_lowercase().as_str() {
        "minute" | "minutes" => RateUnit::Minutes,
        "hour" | "hours" => RateUnit::Hours,
        "day" | "days" => RateUnit::Days,
        _ => return Err(ScheduleError::InvalidRate(raw.to_owned())),
    };
    Ok(Schedule::Rate { every, unit })
}

fn parse_cron(body: &str) -> Result<Schedule, ScheduleError> {
    let fields: Vec<&str> = body.split_whitespace().collect();
    if fields.len() != 6 {
        return Err(ScheduleError::CronFieldCount {
            expr: body.to_owned(),
            found: fields.len(),
        });
    }
    for field in &fields {
        let ok = field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '*' | ',' | '-' | '/' | '?' | '#'));
        if !ok {
            return Err(ScheduleError::CronField {
                field: (*field).to_owned(),
            });
        }
    }
    // minutes hours day-of-month month day-of-week year
    let dom_open = fields[2] == "?";
    let dow_open = fields[4] == "?";
    if dom_open == dow_open {
        return Err(ScheduleError::CronDayConflict(body.to_owned()));
    }
    Ok(Schedule::Cron(fields.join(" ")))
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Rate { every, unit } => write!(f, "rate({every} {})", unit.label(*every)),
            Schedule::Cron(expr) => write!(f, "cron({expr})"),
        }
    }
}

impl TryFrom<String> for Schedule {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Schedule::parse(&value)
    }
}

impl From<Schedule> for String {
    fn from(value: Schedule) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rate_in_hours() {
        let s = Schedule::parse("rate(2 hours)").unwrap();
        assert_eq!(s, Schedule::rate(2, RateUnit::Hours));
        assert_eq!(s.interval(), Some(Duration::from_secs(7_200)));
    }

    #[test]
    fn oversized_rate_has_no_interval() {
        let s = Schedule::parse("rate(999999999999999999 days)").unwrap();
        assert!(s.interval().is_none());
        assert_eq!(
            Schedule::rate(3, RateUnit::Minutes).interval(),
            Some(Duration::from_secs(180))
        );
    }

    #[test]
    fn singular_and_plural_units_are_equivalent() {
        assert_eq!(
            Schedule::parse("rate(1 hours)").unwrap(),
            Schedule::parse("rate(1 hour)").unwrap()
        );
        assert_eq!(Schedule::rate(1, RateUnit::Days).to_string(), "rate(1 day)");
    }

    #[test]
    fn rejects_zero_and_garbage_rates() {
        assert!(matches!(
            Schedule::parse("rate(0 minutes)"),
            Err(ScheduleError::ZeroRate(_))
        ));
        assert!(Schedule::parse("rate(two hours)").is_err());
        assert!(Schedule::parse("rate(5 weeks)").is_err());
        assert!(Schedule::parse("rate(5)").is_err());
    }

    #[test]
    fn parses_cron_and_normalizes_whitespace() {
        let s = Schedule::parse("cron(0  12 * * ? *)").unwrap();
        assert_eq!(s.to_string(), "cron(0 12 * * ? *)");
        assert!(s.interval().is_none());
    }

    #[test]
    fn cron_requires_six_fields() {
        assert!(matches!(
            Schedule::parse("cron(0 12 * * *)"),
            Err(ScheduleError::CronFieldCount { found: 5, .. })
        ));
    }

    #[test]
    fn cron_rejects_both_day_fields() {
        assert!(matches!(
            Schedule::parse("cron(0 12 * * * *)"),
            Err(ScheduleError::CronDayConflict(_))
        ));
        assert!(Schedule::parse("cron(0 12 ? * MON-FRI *)").is_ok());
    }

    #[test]
    fn unknown_form_is_rejected() {
        assert!(matches!(
            Schedule::parse("every 5 minutes"),
            Err(ScheduleError::UnknownForm(_))
        ));
    }

    #[test]
    fn serializes_as_canonical_string() {
        let s = Schedule::parse("rate( 30 minutes )").unwrap();
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"rate(30 minutes)\"");
        let back: Schedule = serde_json::from_str("\"rate(30 minutes)\"").unwrap();
        assert_eq!(back, s);
    }
}
