// Minimal cron-expression matcher shared by the cache warmer's scheduled
// strategy, the scheduled invalidator, and the backup scheduler.

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronField {
    Any,
    Specific(u32),
    Range(u32, u32),
    List(Vec<u32>),
    Step(Box<CronField>, u32),
}

#[derive(Debug, Clone)]
pub struct CronSchedule {
    pub minute: CronField,
    pub hour: CronField,
    pub day_of_month: CronField,
    pub month: CronField,
    pub day_of_week: CronField,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::validation("cron expression must have 5 fields"));
        }
        Ok(Self {
            minute: Self::parse_field(fields[0], 0, 59)?,
            hour: Self::parse_field(fields[1], 0, 23)?,
            day_of_month: Self::parse_field(fields[2], 1, 31)?,
            month: Self::parse_field(fields[3], 1, 12)?,
            day_of_week: Self::parse_field(fields[4], 0, 6)?,
        })
    }

    fn parse_field(field: &str, min: u32, max: u32) -> Result<CronField> {
        if field == "*" {
            return Ok(CronField::Any);
        }
        if let Some((base, step)) = field.split_once('/') {
            let base_field = Self::parse_field(base, min, max)?;
            let step_val = step
                .parse::<u32>()
                .map_err(|_| Error::validation(format!("invalid step in '{field}'")))?;
            return Ok(CronField::Step(Box::new(base_field), step_val));
        }
        if let Some((start, end)) = field.split_once('-') {
            let start_val = start
                .parse::<u32>()
                .map_err(|_| Error::validation(format!("invalid range start in '{field}'")))?;
            let end_val = end
                .parse::<u32>()
                .map_err(|_| Error::validation(format!("invalid range end in '{field}'")))?;
            return Ok(CronField::Range(start_val, end_val));
        }
        if field.contains(',') {
            let values: Result<Vec<u32>> = field
                .split(',')
                .map(|v| {
                    v.parse::<u32>()
                        .map_err(|_| Error::validation(format!("invalid list value in '{field}'")))
                })
                .collect();
            return Ok(CronField::List(values?));
        }
        let value = field
            .parse::<u32>()
            .map_err(|_| Error::validation(format!("invalid field value '{field}'")))?;
        if value < min || value > max {
            return Err(Error::validation(format!("value {value} out of bounds [{min},{max}]")));
        }
        Ok(CronField::Specific(value))
    }

    fn matches_field(field: &CronField, value: u32, min: u32) -> bool {
        match field {
            CronField::Any => true,
            CronField::Specific(v) => *v == value,
            CronField::Range(start, end) => value >= *start && value <= *end,
            CronField::List(values) => values.contains(&value),
            CronField::Step(base, step) => {
                if !Self::matches_field(base, value, min) {
                    return false;
                }
                match base.as_ref() {
                    CronField::Any => (value - min) % step == 0,
                    CronField::Range(start, _) => (value - start) % step == 0,
                    _ => value % step == 0,
                }
            }
        }
    }

    pub fn matches(&self, time: DateTime<Utc>) -> bool {
        Self::matches_field(&self.minute, time.minute(), 0)
            && Self::matches_field(&self.hour, time.hour(), 0)
            && Self::matches_field(&self.day_of_month, time.day(), 1)
            && Self::matches_field(&self.month, time.month(), 1)
            && Self::matches_field(&self.day_of_week, time.weekday().num_days_from_sunday(), 0)
    }

    /// Next matching minute-granularity timestamp after `after`, searching
    /// up to one year ahead.
    pub fn next_execution(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut current = after;
        for _ in 0..(365 * 24 * 60) {
            current += chrono::Duration::minutes(1);
            if self.matches(current) {
                return Some(current);
            }
        }
        None
    }
}
