//! Cron schedules and daily idle windows.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc};
use cron::Schedule;
use thiserror::Error;

/// Errors that can occur when parsing schedule strings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid idle window.
    #[error("invalid idle window: {0}")]
    InvalidIdleWindow(String),
}

/// A parsed cron expression evaluated in UTC.
///
/// Accepts standard 5-field cron (`minute hour day month weekday`), 6- and
/// 7-field cron with a leading seconds field (and trailing year), and the
/// `@hourly`/`@daily`/... shortcuts.
///
/// Numeric weekdays follow the field count. In 5-field expressions they are
/// standard cron: `0`-`7` with both `0` and `7` meaning Sunday. In 6- and
/// 7-field expressions they are `1`-`7` starting at Sunday (`1-5` is Sunday
/// through Thursday). Day names (`MON-FRI`) mean the same in every form.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Box<Schedule>,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();

        let cron_expr = if trimmed.starts_with('@') {
            trimmed.to_lowercase()
        } else {
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            match fields.as_slice() {
                [minute, hour, day, month, weekday] => format!(
                    "0 {} {} {} {} {}",
                    minute,
                    hour,
                    day,
                    month,
                    standard_weekdays(weekday)?
                ),
                fields if fields.len() == 6 || fields.len() == 7 => trimmed.to_string(),
                fields => {
                    return Err(ScheduleError::InvalidCron(format!(
                        "expected 5, 6 or 7 fields, got {}",
                        fields.len()
                    )));
                }
            }
        };

        let schedule = Schedule::from_str(&cron_expr)
            .map_err(|e| ScheduleError::InvalidCron(format!("{}: {}", trimmed, e)))?;

        Ok(Self {
            expression: trimmed.to_string(),
            schedule: Box::new(schedule),
        })
    }

    /// The next occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// The original expression string.
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

/// Rewrite a standard weekday field (`0`-`7`, Sunday is `0` or `7`) into
/// the `cron` crate's numbering (`1`-`7`, Sunday is `1`).
///
/// Names, `*` and `*/n` items are left alone.
fn standard_weekdays(field: &str) -> Result<String, ScheduleError> {
    let invalid = || ScheduleError::InvalidCron(format!("invalid weekday field: {}", field));
    let number = |s: &str| -> Result<u32, ScheduleError> {
        s.parse::<u32>()
            .ok()
            .filter(|day| *day <= 7)
            .ok_or_else(invalid)
    };

    let mut items = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };
        let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        let (first, last) = match base.split_once('-') {
            Some((first, last)) => (first, Some(last)),
            None => (base, None),
        };
        if !numeric(first) || !last.is_none_or(numeric) {
            items.push(item.to_string());
            continue;
        }

        let first = number(first)?;
        let last = match (last, step) {
            (Some(last), _) => number(last)?,
            (None, Some(_)) => 7,
            (None, None) => first,
        };
        let step = match step {
            Some(step) => step.parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(invalid)?,
            None => 1,
        };
        if first > last {
            return Err(invalid());
        }

        let days: BTreeSet<u32> = (first..=last).step_by(step).map(|day| day % 7 + 1).collect();
        for day in days.iter().map(u32::to_string) {
            if !items.contains(&day) {
                items.push(day);
            }
        }
    }
    Ok(items.join(","))
}

/// A daily `HH:MM-HH:MM` range. The range may wrap midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl IdleWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn parse(s: &str) -> Result<Self, ScheduleError> {
        let (start, end) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| ScheduleError::InvalidIdleWindow(s.to_string()))?;

        let parse_time = |t: &str| {
            NaiveTime::parse_from_str(t.trim(), "%H:%M")
                .map_err(|_| ScheduleError::InvalidIdleWindow(s.to_string()))
        };

        Ok(Self {
            start: parse_time(start)?,
            end: parse_time(end)?,
        })
    }

    /// Whether `time` falls inside the window. The end is exclusive.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }
}

impl FromStr for IdleWindow {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for IdleWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}
