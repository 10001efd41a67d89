//! Five-field cron evaluation.
//!
//! Fields are `minute hour day-of-month month day-of-week` (day-of-week
//! 0 = Sunday .. 6 = Saturday). Each field accepts `*`, `N`, `*/N`, `A-B`,
//! `A-B/N`, `N/S` and comma-separated lists of those. A timestamp matches
//! only if every field matches.
//!
//! An expression is only considered due during the first
//! [`FIRING_WINDOW_SECS`] seconds of a matching minute, so a poller with a
//! coarse tick still sees each matching minute once.

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::SchedulerError;

/// Seconds into a matching minute during which the expression is due.
pub const FIRING_WINDOW_SECS: u32 = 30;

/// How far ahead `next_after` searches before giving up.
const MAX_SEARCH_DAYS: i64 = 366 * 5;

#[derive(Debug, Clone, Copy)]
enum Field {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl Field {
    fn bounds(self) -> (u32, u32) {
        match self {
            Field::Minute => (0, 59),
            Field::Hour => (0, 23),
            Field::DayOfMonth => (1, 31),
            Field::Month => (1, 12),
            Field::DayOfWeek => (0, 6),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Field::Minute => "minute",
            Field::Hour => "hour",
            Field::DayOfMonth => "day-of-month",
            Field::Month => "month",
            Field::DayOfWeek => "day-of-week",
        }
    }
}

/// Set of allowed values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1u64 << value) != 0
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

impl CronExpr {
    /// Parse a five-field expression.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidCron` naming the offending field.
    pub fn parse(expr: &str) -> Result<Self, SchedulerError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SchedulerError::InvalidCron(format!(
                "'{}': expected 5 fields, found {}",
                expr,
                fields.len()
            )));
        }

        let parse = |text: &str, field: Field| {
            parse_field(text, field).map_err(|reason| {
                SchedulerError::InvalidCron(format!("'{}': {} field: {}", expr, field.name(), reason))
            })
        };

        Ok(Self {
            source: fields.join(" "),
            minutes: parse(fields[0], Field::Minute)?,
            hours: parse(fields[1], Field::Hour)?,
            days_of_month: parse(fields[2], Field::DayOfMonth)?,
            months: parse(fields[3], Field::Month)?,
            days_of_week: parse(fields[4], Field::DayOfWeek)?,
        })
    }

    /// The normalised source text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the calendar minute of `t` matches, ignoring seconds.
    pub fn matches_minute<T: Datelike + Timelike>(&self, t: &T) -> bool {
        self.minutes.contains(t.minute())
            && self.hours.contains(t.hour())
            && self.matches_day(t)
    }

    fn matches_day<T: Datelike>(&self, t: &T) -> bool {
        self.days_of_month.contains(t.day())
            && self.months.contains(t.month())
            && self.days_of_week.contains(t.weekday().num_days_from_sunday())
    }

    /// Whether the expression is due at `now`, evaluated in `tz`.
    pub fn is_due(&self, now: DateTime<Utc>, tz: Tz) -> bool {
        let local = now.with_timezone(&tz);
        local.second() <= FIRING_WINDOW_SECS && self.matches_minute(&local)
    }

    /// The first matching minute strictly after the minute containing
    /// `after`, evaluated in `tz`. Returns `None` if nothing matches within
    /// five years (e.g. `0 0 31 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        let start = truncate_to_minute(local) + Duration::minutes(1);
        let start_date = start.date();

        for offset in 0..MAX_SEARCH_DAYS {
            let date = start_date + Duration::days(offset);
            if !self.matches_day(&date) {
                continue;
            }
            for hour in (0..24).filter(|h| self.hours.contains(*h)) {
                for minute in (0..60).filter(|m| self.minutes.contains(*m)) {
                    let Some(candidate) = date.and_hms_opt(hour, minute, 0) else {
                        continue;
                    };
                    if candidate < start {
                        continue;
                    }
                    // Minutes skipped by a DST gap have no local time.
                    if let Some(resolved) = tz.from_local_datetime(&candidate).earliest() {
                        return Some(resolved.with_timezone(&Utc));
                    }
                }
            }
        }
        None
    }
}

fn truncate_to_minute(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

fn parse_number(text: &str, field: Field) -> Result<u32, String> {
    let value: u32 = text
        .parse()
        .map_err(|_| format!("'{}' is not a number", text))?;
    let (min, max) = field.bounds();
    if value < min || value > max {
        return Err(format!("{} out of range {}-{}", value, min, max));
    }
    Ok(value)
}

fn parse_field(text: &str, field: Field) -> Result<FieldSet, String> {
    let (min, max) = field.bounds();
    let mut bits = 0u64;

    for part in text.split(',') {
        if part.is_empty() {
            return Err("empty list element".to_string());
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("'{}' is not a valid step", step))?;
                if step == 0 {
                    return Err("step must be > 0".to_string());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (parse_number(a, field)?, parse_number(b, field)?);
            if a > b {
                return Err(format!("range {}-{} is reversed", a, b));
            }
            (a, b)
        } else {
            let value = parse_number(range, field)?;
            // `N/S` runs from N to the end of the field
            if step.is_some() {
                (value, max)
            } else {
                (value, value)
            }
        };

        for value in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            bits |= 1u64 << value;
        }
    }

    Ok(FieldSet(bits))
}

/// Validate a five-field cron expression.
///
/// # Example
///
/// ```
/// use jobd_scheduler::validate_cron_expression;
///
/// assert!(validate_cron_expression("0 0 * * *").is_ok());
/// assert!(validate_cron_expression("*/15 9-17 * * 1-5").is_ok());
/// assert!(validate_cron_expression("invalid").is_err());
/// assert!(validate_cron_expression("").is_err());
/// ```
pub fn validate_cron_expression(expr: &str) -> Result<(), SchedulerError> {
    CronExpr::parse(expr).map(|_| ())
}

/// Whether `expr` is due at `now` (UTC).
///
/// Malformed expressions never match; the parse error is logged.
pub fn matches(expr: &str, now: DateTime<Utc>) -> bool {
    matches_in(expr, now, Tz::UTC)
}

/// Whether `expr` is due at `now`, with fields evaluated in `tz`.
pub fn matches_in(expr: &str, now: DateTime<Utc>, tz: Tz) -> bool {
    match CronExpr::parse(expr) {
        Ok(cron) => cron.is_due(now, tz),
        Err(e) => {
            warn!(cron = %expr, error = %e, "Ignoring malformed cron expression");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_midnight_firing_window() {
        assert!(matches("0 0 * * *", at("2024-01-01T00:00:15Z")));
        assert!(!matches("0 0 * * *", at("2024-01-01T00:00:45Z")));
        assert!(matches("0 0 * * *", at("2024-01-01T00:00:30Z")));
        assert!(!matches("0 0 * * *", at("2024-01-01T00:01:00Z")));
    }

    #[test]
    fn test_wildcard_matches_every_minute() {
        assert!(matches("* * * * *", at("2024-03-09T13:47:00Z")));
    }

    #[test]
    fn test_step_field() {
        assert!(matches("*/15 * * * *", at("2024-01-01T10:45:05Z")));
        assert!(!matches("*/15 * * * *", at("2024-01-01T10:46:05Z")));
    }

    #[test]
    fn test_range_and_list() {
        // 09:00 on a Wednesday
        assert!(matches("0 9-17 * * 1-5", at("2024-01-03T09:00:00Z")));
        // Saturday
        assert!(!matches("0 9-17 * * 1-5", at("2024-01-06T09:00:00Z")));
        assert!(matches("5,10,20 * * * *", at("2024-01-01T00:10:00Z")));
        assert!(!matches("5,10,20 * * * *", at("2024-01-01T00:11:00Z")));
    }

    #[test]
    fn test_range_with_step() {
        let cron = CronExpr::parse("10-30/10 * * * *").unwrap();
        let hits: Vec<u32> = (0..60)
            .filter(|m| cron.minutes.contains(*m))
            .collect();
        assert_eq!(hits, vec![10, 20, 30]);
    }

    #[test]
    fn test_value_with_step_runs_to_end() {
        let cron = CronExpr::parse("0 20/2 * * *").unwrap();
        let hits: Vec<u32> = (0..24).filter(|h| cron.hours.contains(*h)).collect();
        assert_eq!(hits, vec![20, 22]);
    }

    #[test]
    fn test_day_of_week_sunday_is_zero() {
        // 2024-01-07 is a Sunday
        assert!(matches("0 12 * * 0", at("2024-01-07T12:00:00Z")));
        assert!(!matches("0 12 * * 0", at("2024-01-08T12:00:00Z")));
    }

    #[test]
    fn test_day_of_month_and_month() {
        assert!(matches("30 6 15 6 *", at("2024-06-15T06:30:10Z")));
        assert!(!matches("30 6 15 6 *", at("2024-07-15T06:30:10Z")));
    }

    #[test]
    fn test_malformed_expressions_never_match() {
        let now = at("2024-01-01T00:00:00Z");
        for expr in [
            "",
            "invalid",
            "* * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 7",
            "*/0 * * * *",
            "5-1 * * * *",
            "1,,2 * * * *",
            "a-b * * * *",
        ] {
            assert!(!matches(expr, now), "{:?} should not match", expr);
            assert!(validate_cron_expression(expr).is_err(), "{:?} should be invalid", expr);
        }
    }

    #[test]
    fn test_timezone_evaluation() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 14:00Z is 09:00 in New York in January
        assert!(matches_in("0 9 * * *", at("2024-01-10T14:00:05Z"), tz));
        assert!(!matches_in("0 9 * * *", at("2024-01-10T09:00:05Z"), tz));
    }

    #[test]
    fn test_next_after_same_day() {
        let cron = CronExpr::parse("30 12 * * *").unwrap();
        let next = cron.next_after(at("2024-01-01T08:15:40Z"), Tz::UTC).unwrap();
        assert_eq!(next, at("2024-01-01T12:30:00Z"));
    }

    #[test]
    fn test_next_after_is_strictly_later_minute() {
        let cron = CronExpr::parse("* * * * *").unwrap();
        let next = cron.next_after(at("2024-01-01T08:15:00Z"), Tz::UTC).unwrap();
        assert_eq!(next, at("2024-01-01T08:16:00Z"));
    }

    #[test]
    fn test_next_after_rolls_over_year() {
        let cron = CronExpr::parse("0 0 1 1 *").unwrap();
        let next = cron.next_after(at("2024-06-01T00:00:00Z"), Tz::UTC).unwrap();
        assert_eq!(next, at("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn test_next_after_leap_day() {
        let cron = CronExpr::parse("0 0 29 2 *").unwrap();
        let next = cron.next_after(at("2024-03-01T00:00:00Z"), Tz::UTC).unwrap();
        assert_eq!(next, at("2028-02-29T00:00:00Z"));
    }

    #[test]
    fn test_next_after_impossible_date() {
        let cron = CronExpr::parse("0 0 31 2 *").unwrap();
        assert!(cron.next_after(at("2024-01-01T00:00:00Z"), Tz::UTC).is_none());
    }

    proptest! {
        /// Property: evaluation is a pure function of its inputs.
        #[test]
        fn matches_is_deterministic(
            minute in 0u32..60,
            hour in 0u32..24,
            step in 1u32..30,
            secs in 0i64..(4 * 365 * 24 * 3600),
        ) {
            let expr = format!("{} */{} * * *", minute, step);
            let now = at("2022-01-01T00:00:00Z") + Duration::seconds(secs);
            let first = matches(&expr, now);
            prop_assert_eq!(first, matches(&expr, now));
            let other = format!("* {} * * *", hour);
            prop_assert_eq!(matches(&other, now), matches(&other, now));
        }

        /// Property: whenever `next_after` returns a time, that time matches
        /// and no earlier minute in between does.
        #[test]
        fn next_after_finds_first_match(
            minute in 0u32..60,
            step in 1u32..12,
            secs in 0i64..(30 * 24 * 3600),
        ) {
            let cron = CronExpr::parse(&format!("{} */{} * * *", minute, step)).unwrap();
            let from = at("2024-01-01T00:00:00Z") + Duration::seconds(secs);
            let next = cron.next_after(from, Tz::UTC).unwrap();
            prop_assert!(next > from);
            prop_assert!(cron.is_due(next, Tz::UTC));
            let mut probe = next - Duration::minutes(1);
            while probe > from {
                prop_assert!(!cron.matches_minute(&probe));
                probe -= Duration::minutes(1);
            }
        }
    }
}
