// Cron schedule parsing and next firing time calculation
//
// Expressions use the seconds-precision syntax accepted by the `cron` crate:
// `sec min hour day-of-month month day-of-week [year]`.

use crate::errors::ScheduleError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// A validated cron expression bound to the timezone it is evaluated in
#[derive(Debug, Clone)]
pub struct CronSpec {
    expression: String,
    schedule: CronSchedule,
    timezone: Tz,
}

impl CronSpec {
    pub fn parse(expression: &str, timezone: Option<&str>) -> Result<Self, ScheduleError> {
        let schedule = parse_cron_expression(expression)?;
        let timezone = match timezone {
            Some(name) => parse_timezone(name)?,
            None => default_timezone(),
        };
        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
            timezone,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First firing strictly after `reference`
    pub fn next_after(&self, reference: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let reference_in_tz = reference.with_timezone(&self.timezone);
        self.schedule
            .after(&reference_in_tz)
            .next()
            .map(|next| next.with_timezone(&Utc))
            .ok_or_else(|| ScheduleError::NoNextFiring {
                expression: self.expression.clone(),
            })
    }

    /// Number of firings in the half-open window `(from, to]`
    pub fn firings_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> usize {
        let from_in_tz = from.with_timezone(&self.timezone);
        self.schedule
            .after(&from_in_tz)
            .take_while(|next| next.with_timezone(&Utc) <= to)
            .count()
    }
}

/// Parse and validate a cron expression
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(expression.trim()).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    Tz::from_str(name).map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

/// Timezone used when a backup definition does not name one
pub fn default_timezone() -> Tz {
    Tz::UTC
}
