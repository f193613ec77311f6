//! Cron expression parsing and evaluation.
//!
//! Standard 5-field format: `minute hour day month weekday`. Each field
//! is a comma-separated union of spans (`*`, a value, or a range), any of
//! which may carry a `/step` suffix, so `0,30 9-17/2 * * 1-5` parses the
//! way operators expect. Evaluation is timezone-aware: next-fire
//! computation runs in the schedule's IANA timezone so `0 9 * * *` means
//! 9am wall-clock wherever the user lives.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, TimeZone, Timelike};

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronExpression {
    /// Minute (0-59).
    minute: CronField,
    /// Hour (0-23).
    hour: CronField,
    /// Day of month (1-31).
    day: CronField,
    /// Month (1-12).
    month: CronField,
    /// Day of week (0-6, Sunday = 0).
    weekday: CronField,
}

/// The admitted values of one field, as a bitmask.
///
/// Every field's domain fits in 64 bits (the widest is minutes, 0-59),
/// so membership is a single bit test and unioning spans is `|=`.
#[derive(Debug, Clone, Copy)]
struct CronField {
    mask: u64,
}

impl CronField {
    fn admits(self, value: u32) -> bool {
        value < 64 && self.mask & (1 << value) != 0
    }
}

/// Cron expression parser.
pub struct CronParser;

impl CronParser {
    /// Parse a cron expression string.
    ///
    /// # Format
    ///
    /// Standard cron format: `minute hour day month weekday`, where each
    /// field is a comma-separated union of `*`, single values, ranges and
    /// stepped spans (`*/15`, `9-17/2`).
    ///
    /// # Examples
    ///
    /// - `30 6 * * *` - Daily at 06:30
    /// - `*/15 * * * *` - Every quarter hour
    /// - `0 9-17/2 * * 1-5` - Every other hour of the Mon-Fri workday
    /// - `0 8,20 1,15 * *` - 8am and 8pm on the 1st and 15th
    ///
    /// # Errors
    ///
    /// Returns an error if the expression is invalid.
    pub fn parse(expr: &str) -> Result<CronExpression> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, day, month, weekday] = fields.as_slice() else {
            anyhow::bail!(
                "expected 5 whitespace-separated fields, got {} in {expr:?}",
                fields.len()
            );
        };

        Ok(CronExpression {
            minute: Self::parse_field(minute, 0, 59).context("minute field")?,
            hour: Self::parse_field(hour, 0, 23).context("hour field")?,
            day: Self::parse_field(day, 1, 31).context("day-of-month field")?,
            month: Self::parse_field(month, 1, 12).context("month field")?,
            weekday: Self::parse_field(weekday, 0, 6).context("day-of-week field")?,
        })
    }

    /// Parse one field into its admitted-value set.
    ///
    /// Each comma-separated piece is a span (`*`, `a`, or `a-b`) with an
    /// optional `/step`; steps count from the span's low end.
    fn parse_field(spec: &str, min: u32, max: u32) -> Result<CronField> {
        let mut mask = 0u64;

        for piece in spec.split(',') {
            let (span, step) = match piece.split_once('/') {
                Some((span, step)) => {
                    let step: u32 = step
                        .parse()
                        .with_context(|| format!("step is not a number in {piece:?}"))?;
                    anyhow::ensure!(step > 0, "step cannot be zero in {piece:?}");
                    (span, step)
                }
                None => (piece, 1),
            };

            let (lo, hi) = if span == "*" {
                (min, max)
            } else if let Some((lo, hi)) = span.split_once('-') {
                (Self::parse_value(lo, min, max)?, Self::parse_value(hi, min, max)?)
            } else {
                let value = Self::parse_value(span, min, max)?;
                (value, value)
            };
            anyhow::ensure!(lo <= hi, "range runs backwards in {piece:?}");

            let mut value = lo;
            while value <= hi {
                mask |= 1 << value;
                value += step;
            }
        }

        anyhow::ensure!(mask != 0, "no values admitted by {spec:?}");
        Ok(CronField { mask })
    }

    fn parse_value(text: &str, min: u32, max: u32) -> Result<u32> {
        let value: u32 = text
            .parse()
            .with_context(|| format!("{text:?} is not a number"))?;
        anyhow::ensure!(
            (min..=max).contains(&value),
            "{value} is outside {min}-{max}"
        );
        Ok(value)
    }
}

impl CronExpression {
    /// Check if the cron expression matches the given wall-clock time.
    pub fn matches<Tz: TimeZone>(&self, time: &DateTime<Tz>) -> bool {
        self.minute.admits(time.minute())
            && self.hour.admits(time.hour())
            && self.day.admits(time.day())
            && self.month.admits(time.month())
            && self.weekday.admits(time.weekday().num_days_from_sunday())
    }

    /// Calculate the next fire time strictly after the given time, in the
    /// same timezone. Scans minute-by-minute up to a year out.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let mut current = (after.clone() + chrono::Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;
        for _ in 0..(365 * 24 * 60) {
            if self.matches(&current) {
                return Some(current);
            }
            current += chrono::Duration::minutes(1);
        }
        None
    }

    /// Shortest gap between two consecutive fires starting from `after`.
    ///
    /// Used to enforce the minimum-interval policy on schedule creation.
    pub fn fire_interval<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<chrono::Duration> {
        let first = self.next_after(after)?;
        let second = self.next_after(&first)?;
        Some(second - first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_parse_wildcard() {
        let expr = CronParser::parse("* * * * *").unwrap();
        let now = Utc::now();
        assert!(expr.matches(&now));
    }

    #[test]
    fn test_parse_daily_midnight() {
        let expr = CronParser::parse("0 0 * * *").unwrap();
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        assert!(expr.matches(&midnight));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(CronParser::parse("invalid").is_err());
        assert!(CronParser::parse("* * *").is_err());
        assert!(CronParser::parse("60 * * * *").is_err());
        assert!(CronParser::parse("* * * * * *").is_err());
        assert!(CronParser::parse("*/0 * * * *").is_err());
        assert!(CronParser::parse("30-10 * * * *").is_err());
    }

    #[test]
    fn test_list_of_ranges() {
        let expr = CronParser::parse("1,5-7,59 * * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        for (minute, expected) in [(1, true), (4, false), (6, true), (7, true), (59, true)] {
            let time = base.with_minute(minute).unwrap();
            assert_eq!(expr.matches(&time), expected, "minute {minute}");
        }
    }

    #[test]
    fn test_stepped_span_counts_from_low_end() {
        let expr = CronParser::parse("10-40/10 * * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        for (minute, expected) in [(10, true), (20, true), (40, true), (15, false), (50, false)] {
            let time = base.with_minute(minute).unwrap();
            assert_eq!(expr.matches(&time), expected, "minute {minute}");
        }
    }

    #[test]
    fn test_next_after_hourly() {
        let expr = CronParser::parse("0 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 3, 1, 10, 15, 42).unwrap();
        let next = expr.next_after(&after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_next_after_in_timezone() {
        // 9am New York wall clock is 14:00 UTC in winter.
        let tz: chrono_tz::Tz = "America/New_York".parse().unwrap();
        let expr = CronParser::parse("0 9 * * *").unwrap();
        let after = tz.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();

        let next = expr.next_after(&after).unwrap();
        assert_eq!(next.hour(), 9);
        assert_eq!(next.day(), 16);
        assert_eq!(
            next.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2025, 1, 16, 14, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_fire_interval() {
        let hourly = CronParser::parse("0 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(
            hourly.fire_interval(&now).unwrap(),
            chrono::Duration::hours(1)
        );

        let every_five = CronParser::parse("*/5 * * * *").unwrap();
        assert_eq!(
            every_five.fire_interval(&now).unwrap(),
            chrono::Duration::minutes(5)
        );
    }

    #[test]
    fn test_weekday_range() {
        let expr = CronParser::parse("0 9 * * 1-5").unwrap();
        // 2025-03-03 is a Monday.
        let monday = Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap();
        let sunday = Utc.with_ymd_and_hms(2025, 3, 2, 9, 0, 0).unwrap();
        assert!(expr.matches(&monday));
        assert!(!expr.matches(&sunday));
    }
}
