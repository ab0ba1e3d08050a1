/// Timer node parameters to cron recurrences
///
/// A timer node carries either an explicit cron expression (`cronExpression`
/// or `cron`, 5 or 6 fields) or a `secondsInterval`. Intervals are rounded
/// down to whole minutes, hours or days; anything below a minute or beyond a
/// 31-day step cannot be expressed this way and is rejected.

use crate::error::ScheduleError;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Shortest interval a timer node may request
pub const MIN_INTERVAL_SECS: u64 = 60;

/// Longest day step a day-of-month field can hold
const MAX_INTERVAL_DAYS: u64 = 31;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recurrence {
    /// Cron expression as configured or derived (5 or 6 fields)
    expression: String,
    /// Seconds-first 6-field form handed to the job scheduler
    job_expression: String,
}

impl Recurrence {
    /// Derive a recurrence from a timer node's parameters. An explicit cron
    /// expression wins over `secondsInterval`.
    pub fn from_timer_parameters(params: &Map<String, Value>) -> Result<Self, ScheduleError> {
        let cron = ["cronExpression", "cron"]
            .iter()
            .filter_map(|key| params.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .find(|expr| !expr.is_empty());
        if let Some(expression) = cron {
            return Self::from_cron(expression);
        }

        match params.get("secondsInterval") {
            Some(value) => Self::from_interval_secs(parse_interval(value)?),
            None => Err(ScheduleError::MissingSchedule),
        }
    }

    pub fn from_interval_secs(seconds: u64) -> Result<Self, ScheduleError> {
        if seconds < MIN_INTERVAL_SECS {
            return Err(ScheduleError::BelowMinimumInterval {
                seconds,
                minimum: MIN_INTERVAL_SECS,
            });
        }

        if seconds / SECS_PER_DAY > MAX_INTERVAL_DAYS {
            return Err(ScheduleError::IntervalTooLong {
                seconds,
                maximum: MAX_INTERVAL_DAYS * SECS_PER_DAY,
            });
        }

        let minutes = seconds / 60;
        let expression = if minutes < 60 {
            format!("*/{minutes} * * * *")
        } else if minutes < 24 * 60 {
            format!("0 */{} * * *", minutes / 60)
        } else {
            format!("0 0 */{} * *", minutes / (24 * 60))
        };

        Self::from_cron(&expression)
    }

    /// Accept a 5-field (minute-first) or 6-field (seconds-first) expression
    pub fn from_cron(expression: &str) -> Result<Self, ScheduleError> {
        let expression = expression.trim();
        let fields = expression.split_whitespace().count();
        let job_expression = match fields {
            5 => format!("0 {expression}"),
            6 => expression.to_string(),
            n => {
                return Err(ScheduleError::InvalidCron {
                    expression: expression.to_string(),
                    reason: format!("expected 5 or 6 fields, found {n}"),
                })
            }
        };

        job_expression
            .parse::<croner::Cron>()
            .map_err(|e| ScheduleError::InvalidCron {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            expression: expression.to_string(),
            job_expression,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn job_expression(&self) -> &str {
        &self.job_expression
    }

    /// Next time this recurrence fires strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let cron = self.job_expression.parse::<croner::Cron>().ok()?;
        cron.iter_after(after).next()
    }
}

fn parse_interval(value: &Value) -> Result<u64, ScheduleError> {
    let seconds = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match seconds {
        Some(secs) if secs.is_finite() && secs > 0.0 => Ok(secs.floor() as u64),
        _ => Err(ScheduleError::InvalidInterval(value.to_string())),
    }
}
