//! 5-field cron expression parser and next-occurrence calculator.
//! Fields: "MIN HOUR DOM MON DOW", each supporting `*`, lists (`a,b`),
//! ranges (`a-b`), and steps (`*/n`, `a-b/n`). DOW accepts 0-7 (7 = Sunday).
//!
//! Pure computation — no state, no I/O, safe to call from concurrent ticks.

use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone, Timelike};
use taskclaw_core::error::{Result, TaskClawError};

/// Upper bound on field-advance steps during a scan. Generous enough to find
/// rare dates (e.g. "0 0 29 2 *" needs ~1500 day-steps to land on Feb 29).
const MAX_SCAN_STEPS: u32 = 100_000;

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq)]
pub struct CronExpr {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    /// Parse a 5-field cron expression, rejecting malformed input.
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(TaskClawError::InvalidSchedule(format!(
                "Invalid cron expression '{expression}' (need 5 fields: MIN HOUR DOM MON DOW)"
            )));
        }

        let minutes = parse_field(parts[0], 0, 59)?;
        let hours = parse_field(parts[1], 0, 23)?;
        let days_of_month = parse_field(parts[2], 1, 31)?;
        let months = parse_field(parts[3], 1, 12)?;
        // DOW allows 7 as an alias for Sunday.
        let mut days_of_week: Vec<u32> = parse_field(parts[4], 0, 7)?
            .into_iter()
            .map(|d| if d == 7 { 0 } else { d })
            .collect();
        days_of_week.sort_unstable();
        days_of_week.dedup();

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: parts[2] != "*",
            dow_restricted: parts[4] != "*",
        })
    }

    /// Compute the earliest time strictly after `after` matching all fields.
    /// Returns None if no occurrence exists within the scan horizon.
    pub fn next_after(&self, after: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let tz = *after.offset();
        let mut cand = (after + Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;

        for _ in 0..MAX_SCAN_STEPS {
            if !self.months.contains(&cand.month()) {
                cand = start_of_next_month(cand, tz)?;
                continue;
            }
            if !self.day_matches(&cand) {
                cand = start_of_next_day(cand, tz)?;
                continue;
            }
            if !self.hours.contains(&cand.hour()) {
                cand = cand.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(&cand.minute()) {
                cand += Duration::minutes(1);
                continue;
            }
            return Some(cand);
        }
        None
    }

    /// Standard cron day rule: when both DOM and DOW are restricted, a day
    /// matches if either does; otherwise the restricted field decides.
    fn day_matches(&self, t: &DateTime<FixedOffset>) -> bool {
        let dom = self.days_of_month.contains(&t.day());
        let dow = self
            .days_of_week
            .contains(&t.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (false, false) => true,
            (true, false) => dom,
            (false, true) => dow,
            (true, true) => dom || dow,
        }
    }
}

fn start_of_next_day(t: DateTime<FixedOffset>, tz: FixedOffset) -> Option<DateTime<FixedOffset>> {
    let next = t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?;
    tz.from_local_datetime(&next).single()
}

fn start_of_next_month(t: DateTime<FixedOffset>, tz: FixedOffset) -> Option<DateTime<FixedOffset>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    tz.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

/// Parse one cron field into a sorted list of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<u32>> {
    if field.is_empty() {
        return Err(TaskClawError::InvalidSchedule("Empty cron field".into()));
    }

    let mut values = Vec::new();
    for item in field.split(',') {
        values.extend(parse_item(item, min, max)?);
    }
    values.sort_unstable();
    values.dedup();
    Ok(values)
}

/// Parse one comma-separated item: `*`, `n`, `a-b`, optionally with `/step`.
fn parse_item(item: &str, min: u32, max: u32) -> Result<Vec<u32>> {
    let bad = |msg: String| TaskClawError::InvalidSchedule(msg);

    let (base, step) = match item.split_once('/') {
        Some((base, step_str)) => {
            let step: u32 = step_str
                .parse()
                .map_err(|_| bad(format!("Invalid cron step: '{item}'")))?;
            if step == 0 {
                return Err(bad(format!("Cron step must be positive: '{item}'")));
            }
            (base, step)
        }
        None => (item, 1),
    };

    let (start, end) = if base == "*" {
        (min, max)
    } else if let Some((a, b)) = base.split_once('-') {
        let a: u32 = a
            .parse()
            .map_err(|_| bad(format!("Invalid cron range: '{item}'")))?;
        let b: u32 = b
            .parse()
            .map_err(|_| bad(format!("Invalid cron range: '{item}'")))?;
        if a > b {
            return Err(bad(format!("Cron range start exceeds end: '{item}'")));
        }
        (a, b)
    } else {
        let n: u32 = base
            .parse()
            .map_err(|_| bad(format!("Invalid cron value: '{item}'")))?;
        // "n/step" means n..max in standard cron; a bare "n" is just n.
        if item.contains('/') { (n, max) } else { (n, n) }
    };

    if start < min || end > max {
        return Err(bad(format!(
            "Cron value out of range {min}-{max}: '{item}'"
        )));
    }

    Ok((start..=end).step_by(step as usize).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<FixedOffset> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
            .fixed_offset()
    }

    #[test]
    fn test_every_five_minutes() {
        let next = CronExpr::parse("*/5 * * * *")
            .unwrap()
            .next_after(utc(2024, 1, 1, 0, 2))
            .unwrap();
        assert_eq!(next, utc(2024, 1, 1, 0, 5));
    }

    #[test]
    fn test_strictly_after_on_boundary() {
        // Already on a matching minute — must return the next one, not itself.
        let next = CronExpr::parse("*/5 * * * *")
            .unwrap()
            .next_after(utc(2024, 1, 1, 0, 5))
            .unwrap();
        assert_eq!(next, utc(2024, 1, 1, 0, 10));
    }

    #[test]
    fn test_idempotent_chain() {
        let expr = CronExpr::parse("0 8 * * *").unwrap();
        let t1 = expr.next_after(utc(2024, 3, 10, 7, 0)).unwrap();
        assert_eq!(t1, utc(2024, 3, 10, 8, 0));
        let t2 = expr.next_after(t1).unwrap();
        assert_eq!(t2, utc(2024, 3, 11, 8, 0));
    }

    #[test]
    fn test_specific_time() {
        let expr = CronExpr::parse("30 14 * * *").unwrap();
        let next = expr.next_after(utc(2024, 1, 1, 15, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 2, 14, 30));
    }

    #[test]
    fn test_lists_and_ranges() {
        let expr = CronExpr::parse("0,30 9-17 * * *").unwrap();
        let next = expr.next_after(utc(2024, 1, 1, 9, 10)).unwrap();
        assert_eq!(next, utc(2024, 1, 1, 9, 30));
        let next = expr.next_after(utc(2024, 1, 1, 17, 45)).unwrap();
        assert_eq!(next, utc(2024, 1, 2, 9, 0));
    }

    #[test]
    fn test_range_with_step() {
        let expr = CronExpr::parse("10-50/20 * * * *").unwrap();
        let next = expr.next_after(utc(2024, 1, 1, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 1, 0, 10));
        let next = expr.next_after(next).unwrap();
        assert_eq!(next, utc(2024, 1, 1, 0, 30));
    }

    #[test]
    fn test_day_of_week() {
        // 2024-01-01 is a Monday; next Sunday is 2024-01-07. 7 aliases 0.
        let expr = CronExpr::parse("0 0 * * 7").unwrap();
        let next = expr.next_after(utc(2024, 1, 1, 12, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 7, 0, 0));
    }

    #[test]
    fn test_dom_dow_union() {
        // Both restricted: the 15th OR a Monday, whichever comes first.
        let expr = CronExpr::parse("0 0 15 * 1").unwrap();
        let next = expr.next_after(utc(2024, 1, 2, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 8, 0, 0)); // Monday comes before the 15th
        let next = expr.next_after(utc(2024, 1, 13, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 15, 0, 0));
    }

    #[test]
    fn test_month_rollover() {
        let expr = CronExpr::parse("0 0 1 3 *").unwrap();
        let next = expr.next_after(utc(2024, 1, 15, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 3, 1, 0, 0));
    }

    #[test]
    fn test_leap_day() {
        let expr = CronExpr::parse("0 0 29 2 *").unwrap();
        let next = expr.next_after(utc(2023, 3, 1, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 2, 29, 0, 0));
    }

    #[test]
    fn test_timezone_offset_evaluation() {
        // "0 8 * * *" in +07:00 is 01:00 UTC.
        let tz = FixedOffset::east_opt(7 * 3600).unwrap();
        let after = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .unwrap()
            .with_timezone(&tz);
        let expr = CronExpr::parse("0 8 * * *").unwrap();
        let next = expr.next_after(after).unwrap();
        assert_eq!(
            next.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(CronExpr::parse("bad").is_err());
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("* * * * * *").is_err());
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("* 24 * * *").is_err());
        assert!(CronExpr::parse("* * 0 * *").is_err());
        assert!(CronExpr::parse("* * * 13 *").is_err());
        assert!(CronExpr::parse("* * * * 8").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("5-2 * * * *").is_err());
    }
}
