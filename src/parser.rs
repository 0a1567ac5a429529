//! Cron pattern compiler
//!
//! Supports extended 6-field cron syntax:
//! ```text
//! ┌───────────── second (0-59)
//! │ ┌───────────── minute (0-59)
//! │ │ ┌───────────── hour (0-23)
//! │ │ │ ┌───────────── day of month (1-31)
//! │ │ │ │ ┌───────────── month (1-12, or jan-dec)
//! │ │ │ │ │ ┌───────────── day of week (0-6, 0=Sunday, or sun-sat)
//! │ │ │ │ │ │
//! * * * * * *
//! ```
//!
//! Special characters:
//! - `*` - any value
//! - `?` - any value (day and weekday fields only)
//! - `,` - value list separator (e.g., `1,3,5`)
//! - `-` - range (e.g., `1-5`, `mon-fri`)
//! - `/` - step (e.g., `*/5` or `0-30/5`)
//!
//! Predefined aliases (`@yearly`, `@annually`, `@monthly`, `@weekly`,
//! `@daily`, `@midnight`, `@hourly`) expand to 6-field patterns, and
//! `@every <duration>` compiles to an interval anchored at compile time.

use crate::types::{CronError, Result};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Month name table for the month field
const MONTH_NAMES: [(&str, u32); 12] = [
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

/// Weekday name table for the weekday field (0 = Sunday)
const WEEKDAY_NAMES: [(&str, u32); 7] = [
    ("sun", 0),
    ("mon", 1),
    ("tue", 2),
    ("wed", 3),
    ("thu", 4),
    ("fri", 5),
    ("sat", 6),
];

/// A compiled schedule predicate
///
/// Either a fixed interval ("every N seconds", anchored at compile time) or
/// six pre-materialized per-field match sets. Day-of-month and day-of-week
/// combine with logical AND: a time matches only when both sets contain it.
/// This deliberately differs from classic cron's OR convention for
/// non-wildcard day/weekday fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledSchedule {
    /// Original pattern string
    pub pattern: String,
    /// Interval length in seconds; 0 means field mode
    every_secs: i64,
    /// Compile timestamp; the anchor for interval mode
    created_at: DateTime<Utc>,
    /// Allowed seconds (0-59)
    seconds: BTreeSet<u32>,
    /// Allowed minutes (0-59)
    minutes: BTreeSet<u32>,
    /// Allowed hours (0-23)
    hours: BTreeSet<u32>,
    /// Allowed days of month (1-31)
    days: BTreeSet<u32>,
    /// Allowed months (1-12)
    months: BTreeSet<u32>,
    /// Allowed days of week (0-6, 0=Sunday)
    weekdays: BTreeSet<u32>,
}

impl CompiledSchedule {
    /// Compile a schedule pattern
    ///
    /// # Examples
    ///
    /// ```
    /// use cronbeat::CompiledSchedule;
    ///
    /// // Every 5 minutes at second 0
    /// let schedule = CompiledSchedule::compile("0 */5 * * * *").unwrap();
    ///
    /// // Every weekday at 9 AM
    /// let schedule = CompiledSchedule::compile("0 0 9 * * mon-fri").unwrap();
    ///
    /// // Every 90 seconds, counted from compile time
    /// let schedule = CompiledSchedule::compile("@every 1m30s").unwrap();
    /// ```
    pub fn compile(pattern: &str) -> Result<Self> {
        let trimmed = pattern.trim();

        if let Some(rest) = trimmed.strip_prefix('@') {
            return Self::compile_alias(trimmed, rest);
        }

        Self::compile_fields(trimmed, trimmed)
    }

    /// Expand an `@alias` or `@every <duration>` pattern
    fn compile_alias(pattern: &str, rest: &str) -> Result<Self> {
        let lower = rest.to_ascii_lowercase();

        if lower == "every" || lower.starts_with("every ") {
            let arg = lower["every".len()..].trim();
            if arg.is_empty() {
                return Err(CronError::InvalidDuration(
                    "@every requires a duration argument".to_string(),
                ));
            }
            let duration = humantime::parse_duration(arg)
                .map_err(|e| CronError::InvalidDuration(format!("'{}': {}", arg, e)))?;
            let every_secs = duration.as_secs() as i64;
            if every_secs == 0 {
                return Err(CronError::InvalidDuration(format!(
                    "'{}' is shorter than one second",
                    arg
                )));
            }
            return Ok(Self {
                pattern: pattern.to_string(),
                every_secs,
                created_at: Utc::now(),
                seconds: BTreeSet::new(),
                minutes: BTreeSet::new(),
                hours: BTreeSet::new(),
                days: BTreeSet::new(),
                months: BTreeSet::new(),
                weekdays: BTreeSet::new(),
            });
        }

        let expanded = match lower.as_str() {
            "yearly" | "annually" => "0 0 0 1 1 *",
            "monthly" => "0 0 0 1 * *",
            "weekly" => "0 0 0 * * 0",
            "daily" | "midnight" => "0 0 0 * * *",
            "hourly" => "0 0 * * * *",
            _ => return Err(CronError::UnknownAlias(pattern.to_string())),
        };

        Self::compile_fields(pattern, expanded)
    }

    /// Parse a six-field pattern into match sets
    fn compile_fields(pattern: &str, fields: &str) -> Result<Self> {
        let parts: Vec<&str> = fields.split_whitespace().collect();

        if parts.len() != 6 {
            return Err(CronError::InvalidPattern(format!(
                "expected 6 fields, got {} in '{}'",
                parts.len(),
                pattern
            )));
        }

        let seconds = parse_field(parts[0], 0, 59, "second", None, false)?;
        let minutes = parse_field(parts[1], 0, 59, "minute", None, false)?;
        let hours = parse_field(parts[2], 0, 23, "hour", None, false)?;
        let days = parse_field(parts[3], 1, 31, "day", None, true)?;
        let months = parse_field(parts[4], 1, 12, "month", Some(&MONTH_NAMES), false)?;
        let weekdays = parse_field(parts[5], 0, 6, "weekday", Some(&WEEKDAY_NAMES), true)?;

        Ok(Self {
            pattern: pattern.to_string(),
            every_secs: 0,
            created_at: Utc::now(),
            seconds,
            minutes,
            hours,
            days,
            months,
            weekdays,
        })
    }

    /// Whether this schedule is in interval mode (`@every`)
    pub fn is_interval(&self) -> bool {
        self.every_secs > 0
    }

    /// Interval length in seconds; 0 in field mode
    pub fn every_secs(&self) -> i64 {
        self.every_secs
    }

    /// Compile timestamp; the anchor for interval schedules
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Check whether a time satisfies this schedule, ignoring drift state
    ///
    /// Interval schedules match whole multiples of the interval counted from
    /// the compile-time anchor; field schedules require every set to contain
    /// the corresponding component of `t`.
    pub fn matches(&self, t: &DateTime<Utc>) -> bool {
        if self.is_interval() {
            let delta = t.timestamp() - self.created_at.timestamp();
            return delta > 0 && delta % self.every_secs == 0;
        }

        self.seconds.contains(&t.second())
            && self.minutes.contains(&t.minute())
            && self.hours.contains(&t.hour())
            && self.days.contains(&t.day())
            && self.months.contains(&t.month())
            && self.weekdays.contains(&t.weekday().num_days_from_sunday())
    }

    /// Smallest interval between two fires of this schedule, in seconds
    ///
    /// Used as the re-fire guard at match time: a delayed heartbeat must not
    /// trigger a fixed-second field twice inside the same granular window.
    pub(crate) fn min_interval_secs(&self) -> i64 {
        if self.is_interval() {
            self.every_secs
        } else if self.seconds.len() > 1 {
            1
        } else if self.minutes.len() > 1 {
            60
        } else if self.hours.len() > 1 {
            3_600
        } else {
            86_400
        }
    }

    /// Calculate the next matching time strictly after the given time
    ///
    /// Classic carry algorithm: advance month, then day (AND weekday), hour,
    /// minute, second, truncating lower-order fields on every carry. Returns
    /// `None` when nothing matches within five years (e.g. `0 0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_interval() {
            let anchor = self.created_at.timestamp();
            let from = after.timestamp();
            let n = if from < anchor {
                1
            } else {
                (from - anchor) / self.every_secs + 1
            };
            return Utc.timestamp_opt(anchor + n * self.every_secs, 0).single();
        }

        let mut t = (after + Duration::seconds(1)).with_nanosecond(0)?;
        let bound = Utc
            .with_ymd_and_hms(after.year() + 5, 12, 31, 23, 59, 59)
            .single()?;

        loop {
            if t > bound {
                return None;
            }
            if !self.months.contains(&t.month()) {
                t = start_of_next_month(&t)?;
                continue;
            }
            if !self.days.contains(&t.day())
                || !self.weekdays.contains(&t.weekday().num_days_from_sunday())
            {
                t = start_of_next_day(&t)?;
                continue;
            }
            if !self.hours.contains(&t.hour()) {
                t = t.with_minute(0)?.with_second(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(&t.minute()) {
                t = t.with_second(0)? + Duration::minutes(1);
                continue;
            }
            if !self.seconds.contains(&t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Some(t);
        }
    }

    /// Get a human-readable description of the schedule
    pub fn describe(&self) -> String {
        if self.is_interval() {
            let d = std::time::Duration::from_secs(self.every_secs as u64);
            return format!("every {}", humantime::format_duration(d));
        }

        let mut parts = Vec::new();

        if self.seconds.len() == 60 {
            parts.push("every second".to_string());
        } else if self.seconds.len() > 1 {
            parts.push(format!("at seconds {:?}", self.seconds));
        }

        if self.minutes.len() == 60 {
            parts.push("every minute".to_string());
        } else if self.minutes.len() == 1 {
            let min = self.minutes.first().copied().unwrap_or(0);
            if min == 0 {
                parts.push("at the start of the hour".to_string());
            } else {
                parts.push(format!("at minute {}", min));
            }
        } else {
            parts.push(format!("at minutes {:?}", self.minutes));
        }

        if self.hours.len() < 24 {
            if self.hours.len() == 1 {
                let hour = self.hours.first().copied().unwrap_or(0);
                parts.push(format!("at {}:00", hour));
            } else {
                parts.push(format!("during hours {:?}", self.hours));
            }
        }

        if self.days.len() < 31 {
            parts.push(format!("on days {:?}", self.days));
        }

        if self.months.len() < 12 {
            parts.push(format!("in months {:?}", self.months));
        }

        if self.weekdays.len() < 7 {
            let names: Vec<&str> = self
                .weekdays
                .iter()
                .map(|&d| match d {
                    0 => "Sun",
                    1 => "Mon",
                    2 => "Tue",
                    3 => "Wed",
                    4 => "Thu",
                    5 => "Fri",
                    6 => "Sat",
                    _ => "?",
                })
                .collect();
            parts.push(format!("on {}", names.join(", ")));
        }

        parts.join(", ")
    }

    #[cfg(test)]
    pub(crate) fn with_anchor(mut self, anchor: DateTime<Utc>) -> Self {
        self.created_at = anchor;
        self
    }
}

/// First second of the month after `t`
fn start_of_next_month(t: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

/// Midnight of the day after `t`
fn start_of_next_day(t: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc())
}

/// Parse a single cron field into its value set
///
/// `names` supplies the textual value table (months or weekdays) and
/// `allow_any` permits the `?` wildcard (day and weekday fields).
fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    name: &str,
    names: Option<&[(&str, u32)]>,
    allow_any: bool,
) -> Result<BTreeSet<u32>> {
    let mut values = BTreeSet::new();

    for part in field.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        // Handle step values (e.g., */5 or 0-30/5)
        let (range_part, step) = if let Some(idx) = part.find('/') {
            let step_str = &part[idx + 1..];
            let step: u32 = step_str.parse().map_err(|_| {
                CronError::InvalidPattern(format!(
                    "invalid step value '{}' in {} field",
                    step_str, name
                ))
            })?;
            if step == 0 {
                return Err(CronError::InvalidPattern(format!(
                    "step value cannot be 0 in {} field",
                    name
                )));
            }
            (&part[..idx], Some(step))
        } else {
            (part, None)
        };

        // Parse the range part
        let (start, end) = if range_part == "*" || (range_part == "?" && allow_any) {
            (min, max)
        } else if let Some(idx) = range_part.find('-') {
            let start = parse_value(&range_part[..idx], names).ok_or_else(|| {
                CronError::InvalidPattern(format!(
                    "invalid range start '{}' in {} field",
                    &range_part[..idx],
                    name
                ))
            })?;
            let end = parse_value(&range_part[idx + 1..], names).ok_or_else(|| {
                CronError::InvalidPattern(format!(
                    "invalid range end '{}' in {} field",
                    &range_part[idx + 1..],
                    name
                ))
            })?;
            (start, end)
        } else {
            let value = parse_value(range_part, names).ok_or_else(|| {
                CronError::InvalidPattern(format!(
                    "invalid value '{}' in {} field",
                    range_part, name
                ))
            })?;
            (value, value)
        };

        // Validate range
        if start < min || start > max {
            return Err(CronError::InvalidPattern(format!(
                "value {} out of range ({}-{}) in {} field",
                start, min, max, name
            )));
        }
        if end < min || end > max {
            return Err(CronError::InvalidPattern(format!(
                "value {} out of range ({}-{}) in {} field",
                end, min, max, name
            )));
        }
        if start > end {
            return Err(CronError::InvalidPattern(format!(
                "invalid range {}-{} in {} field",
                start, end, name
            )));
        }

        // Add values with step
        let step = step.unwrap_or(1);
        let mut current = start;
        while current <= end {
            values.insert(current);
            current += step;
        }
    }

    if values.is_empty() {
        return Err(CronError::InvalidPattern(format!(
            "no valid values in {} field",
            name
        )));
    }

    Ok(values)
}

/// Parse a single field value, numeric or textual (e.g. `feb`, `MON`)
fn parse_value(token: &str, names: Option<&[(&str, u32)]>) -> Option<u32> {
    if let Ok(value) = token.parse::<u32>() {
        return Some(value);
    }
    let lower = token.to_ascii_lowercase();
    names?.iter().find(|(n, _)| *n == lower).map(|(_, v)| *v)
}
