//! Cron expression parsing and next-fire computation.
//!
//! Accepts 5-field (`min hour dom month dow`) and 6-field
//! (`sec min hour dom month dow`, seconds first) expressions with lists,
//! ranges, steps, and month/weekday names. When both day-of-month and
//! day-of-week are restricted, a day matches if EITHER does (common cron
//! convention). All times are UTC.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use crate::error::{Result, SchedulerError};

/// Upper bound on the day-by-day search; expressions that never match
/// (e.g. Feb 30) return `None` instead of spinning forever.
const MAX_SEARCH_DAYS: i64 = 4 * 366;

const MONTH_NAMES: &[(&str, u8)] = &[
    ("jan", 1), ("feb", 2), ("mar", 3), ("apr", 4), ("may", 5), ("jun", 6),
    ("jul", 7), ("aug", 8), ("sep", 9), ("oct", 10), ("nov", 11), ("dec", 12),
];

const DOW_NAMES: &[(&str, u8)] = &[
    ("sun", 0), ("mon", 1), ("tue", 2), ("wed", 3), ("thu", 4), ("fri", 5), ("sat", 6),
];

/// One parsed field: the allowed values plus whether the field was
/// restricted at all (a bare `*` or `*/1` is unrestricted).
#[derive(Debug, Clone)]
struct Field {
    allowed: Vec<u8>,
    restricted: bool,
}

impl Field {
    fn contains(&self, v: u8) -> bool {
        self.allowed.binary_search(&v).is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct CronExpr {
    seconds: Field,
    minutes: Field,
    hours: Field,
    dom: Field,
    months: Field,
    dow: Field,
}

impl CronExpr {
    /// Parse a 5- or 6-field expression. 6-field is seconds-first; 5-field
    /// gets an implicit `0` seconds field.
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let (sec, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => {
                return Err(SchedulerError::InvalidExpression(format!(
                    "expected 5 or 6 fields, got {n}: {expr}"
                )))
            }
        };

        Ok(Self {
            seconds: parse_field(sec, 0, 59, &[])?,
            minutes: parse_field(rest[0], 0, 59, &[])?,
            hours: parse_field(rest[1], 0, 23, &[])?,
            dom: parse_field(rest[2], 1, 31, &[])?,
            months: parse_field(rest[3], 1, 12, MONTH_NAMES)?,
            dow: parse_dow(rest[4])?,
        })
    }

    /// The earliest fire time strictly after `from`, or `None` when the
    /// expression can never match.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = (from + Duration::seconds(1)).with_nanosecond(0)?;
        let mut day = start.date_naive();

        for i in 0..MAX_SEARCH_DAYS {
            if self.day_matches(day) {
                // On the first day, resume from the start time-of-day;
                // later days scan from midnight.
                let (h0, m0, s0) = if i == 0 {
                    (start.hour() as u8, start.minute() as u8, start.second() as u8)
                } else {
                    (0, 0, 0)
                };
                if let Some((h, m, s)) = self.next_time_of_day(h0, m0, s0) {
                    return Utc
                        .with_ymd_and_hms(day.year(), day.month(), day.day(), h as u32, m as u32, s as u32)
                        .single();
                }
            }
            day = day.succ_opt()?;
        }
        None
    }

    /// DOM/DOW combine with OR when both are restricted; otherwise a
    /// wildcard side always matches and the restricted side decides.
    fn day_matches(&self, day: chrono::NaiveDate) -> bool {
        if !self.months.contains(day.month() as u8) {
            return false;
        }
        let dom_ok = self.dom.contains(day.day() as u8);
        let dow_ok = self
            .dow
            .contains(day.weekday().num_days_from_sunday() as u8);

        match (self.dom.restricted, self.dow.restricted) {
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }

    /// Smallest allowed `(hour, minute, second)` at or after the given one.
    fn next_time_of_day(&self, h0: u8, m0: u8, s0: u8) -> Option<(u8, u8, u8)> {
        for &h in &self.hours.allowed {
            if h < h0 {
                continue;
            }
            for &m in &self.minutes.allowed {
                if h == h0 && m < m0 {
                    continue;
                }
                for &s in &self.seconds.allowed {
                    if h == h0 && m == m0 && s < s0 {
                        continue;
                    }
                    return Some((h, m, s));
                }
            }
        }
        None
    }
}

fn parse_field(raw: &str, min: u8, max: u8, names: &[(&str, u8)]) -> Result<Field> {
    let mut allowed = Vec::new();
    let mut restricted = false;

    for part in raw.split(',') {
        let (range_part, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u8 = s
                    .parse()
                    .map_err(|_| SchedulerError::InvalidExpression(format!("bad step: {part}")))?;
                if step == 0 {
                    return Err(SchedulerError::InvalidExpression(format!("zero step: {part}")));
                }
                (r, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range_part == "*" {
            if step > 1 {
                restricted = true;
            }
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            restricted = true;
            (resolve(a, names, min, max)?, resolve(b, names, min, max)?)
        } else {
            restricted = true;
            let v = resolve(range_part, names, min, max)?;
            // a bare value with a step ("5/15") ranges to the max
            if step > 1 {
                (v, max)
            } else {
                (v, v)
            }
        };

        if lo > hi {
            return Err(SchedulerError::InvalidExpression(format!(
                "inverted range: {part}"
            )));
        }

        let mut v = lo;
        while v <= hi {
            allowed.push(v);
            match v.checked_add(step) {
                Some(next) => v = next,
                None => break,
            }
        }
    }

    if allowed.is_empty() {
        return Err(SchedulerError::InvalidExpression(format!("empty field: {raw}")));
    }
    allowed.sort_unstable();
    allowed.dedup();
    Ok(Field { allowed, restricted })
}

fn parse_dow(raw: &str) -> Result<Field> {
    let mut field = parse_field(raw, 0, 7, DOW_NAMES)?;
    // 7 is an alias for Sunday
    if field.allowed.contains(&7) {
        field.allowed.retain(|&v| v != 7);
        field.allowed.insert(0, 0);
        field.allowed.sort_unstable();
        field.allowed.dedup();
    }
    Ok(field)
}

fn resolve(token: &str, names: &[(&str, u8)], min: u8, max: u8) -> Result<u8> {
    let lower = token.to_lowercase();
    if let Some(&(_, v)) = names.iter().find(|(n, _)| *n == lower) {
        return Ok(v);
    }
    let v: u8 = token
        .parse()
        .map_err(|_| SchedulerError::InvalidExpression(format!("bad value: {token}")))?;
    if v < min || v > max {
        return Err(SchedulerError::InvalidExpression(format!(
            "value {v} out of range {min}-{max}"
        )));
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn six_field_every_five_seconds() {
        let expr = CronExpr::parse("*/5 * * * * *").unwrap();
        let t0 = at(2026, 3, 1, 12, 0, 2);
        let t1 = expr.next_after(t0).unwrap();
        assert_eq!(t1, at(2026, 3, 1, 12, 0, 5));
        let t2 = expr.next_after(t1).unwrap();
        assert_eq!(t2, at(2026, 3, 1, 12, 0, 10));
    }

    #[test]
    fn six_field_every_ten_minutes() {
        let expr = CronExpr::parse("0 */10 * * * *").unwrap();
        let t1 = expr.next_after(at(2026, 3, 1, 12, 3, 30)).unwrap();
        assert_eq!(t1, at(2026, 3, 1, 12, 10, 0));
        let t2 = expr.next_after(t1).unwrap();
        assert_eq!(t2, at(2026, 3, 1, 12, 20, 0));
    }

    #[test]
    fn five_field_has_implicit_zero_seconds() {
        let expr = CronExpr::parse("30 9 * * *").unwrap();
        let t = expr.next_after(at(2026, 3, 1, 9, 30, 0)).unwrap();
        // 09:30:00 has passed (search is strictly after), next is tomorrow
        assert_eq!(t, at(2026, 3, 2, 9, 30, 0));
        let t = expr.next_after(at(2026, 3, 1, 8, 0, 0)).unwrap();
        assert_eq!(t, at(2026, 3, 1, 9, 30, 0));
    }

    #[test]
    fn dom_or_dow_fires_on_either() {
        // 1st of the month OR any Monday, at midnight
        let expr = CronExpr::parse("0 0 1 * MON").unwrap();
        // Sun 2026-03-01 is the 1st → matches by DOM
        let t = expr.next_after(at(2026, 2, 27, 0, 0, 0)).unwrap();
        assert_eq!(t, at(2026, 3, 1, 0, 0, 0));
        // next match: Mon 2026-03-02 by DOW
        let t = expr.next_after(t).unwrap();
        assert_eq!(t, at(2026, 3, 2, 0, 0, 0));
        // then Mon 2026-03-09, not the 1st again
        let t = expr.next_after(t).unwrap();
        assert_eq!(t, at(2026, 3, 9, 0, 0, 0));
    }

    #[test]
    fn restricted_dom_with_wildcard_dow_uses_dom_only() {
        let expr = CronExpr::parse("0 12 15 * *").unwrap();
        let t = expr.next_after(at(2026, 3, 1, 0, 0, 0)).unwrap();
        assert_eq!(t, at(2026, 3, 15, 12, 0, 0));
    }

    #[test]
    fn month_and_dow_names_resolve() {
        let expr = CronExpr::parse("0 9 * JAN SUN").unwrap();
        let t = expr.next_after(at(2026, 12, 30, 0, 0, 0)).unwrap();
        // first Sunday of January 2027 is the 3rd
        assert_eq!(t, at(2027, 1, 3, 9, 0, 0));
    }

    #[test]
    fn dow_seven_is_sunday() {
        let a = CronExpr::parse("0 0 * * 0").unwrap();
        let b = CronExpr::parse("0 0 * * 7").unwrap();
        let from = at(2026, 3, 4, 0, 0, 0);
        assert_eq!(a.next_after(from), b.next_after(from));
    }

    #[test]
    fn impossible_date_returns_none() {
        let expr = CronExpr::parse("0 0 30 FEB *").unwrap();
        assert!(expr.next_after(at(2026, 1, 1, 0, 0, 0)).is_none());
    }

    #[test]
    fn lists_and_ranges() {
        let expr = CronExpr::parse("0 8-10,14 * * *").unwrap();
        let mut t = at(2026, 3, 1, 7, 0, 0);
        let mut hours = Vec::new();
        for _ in 0..4 {
            t = expr.next_after(t).unwrap();
            hours.push(t.hour());
        }
        assert_eq!(hours, vec![8, 9, 10, 14]);
    }

    #[test]
    fn wrong_field_count_rejected() {
        assert!(CronExpr::parse("* * *").is_err());
        assert!(CronExpr::parse("* * * * * * *").is_err());
        assert!(CronExpr::parse("61 * * * *").is_err());
    }
}
