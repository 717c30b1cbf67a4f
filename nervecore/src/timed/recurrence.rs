//! Recurrence rules for timed signals.
//!
//! The supported grammar is the RRULE subset that actually appears in
//! reminder and report schedules: `FREQ` (MINUTELY/HOURLY/DAILY/WEEKLY/
//! MONTHLY), `INTERVAL`, `BYHOUR`, `BYMINUTE`, and `BYDAY`. Occurrences are
//! computed in the rule's IANA timezone and returned in UTC.

use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum RecurrenceError {
    #[error("rrule is missing FREQ: `{rrule}`")]
    #[diagnostic(code(nervecore::timed::rrule_missing_freq))]
    MissingFreq { rrule: String },

    #[error("unsupported rrule component `{component}` in `{rrule}`")]
    #[diagnostic(code(nervecore::timed::rrule_unsupported))]
    Unsupported { component: String, rrule: String },

    #[error("invalid rrule value `{value}` for `{component}`")]
    #[diagnostic(code(nervecore::timed::rrule_invalid_value))]
    InvalidValue { component: String, value: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freq {
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recurrence {
    pub freq: Freq,
    pub interval: u32,
    pub by_hour: Option<u32>,
    pub by_minute: Option<u32>,
    pub by_day: Vec<Weekday>,
}

impl Recurrence {
    pub fn parse(rrule: &str) -> Result<Self, RecurrenceError> {
        let mut freq = None;
        let mut interval = 1u32;
        let mut by_hour = None;
        let mut by_minute = None;
        let mut by_day = Vec::new();

        for component in rrule.split(';').filter(|c| !c.trim().is_empty()) {
            let (key, value) = component.split_once('=').ok_or_else(|| {
                RecurrenceError::Unsupported {
                    component: component.to_string(),
                    rrule: rrule.to_string(),
                }
            })?;
            match key.trim().to_ascii_uppercase().as_str() {
                "FREQ" => {
                    freq = Some(match value.trim().to_ascii_uppercase().as_str() {
                        "MINUTELY" => Freq::Minutely,
                        "HOURLY" => Freq::Hourly,
                        "DAILY" => Freq::Daily,
                        "WEEKLY" => Freq::Weekly,
                        "MONTHLY" => Freq::Monthly,
                        other => {
                            return Err(RecurrenceError::InvalidValue {
                                component: "FREQ".to_string(),
                                value: other.to_string(),
                            })
                        }
                    });
                }
                "INTERVAL" => {
                    interval = value.trim().parse().map_err(|_| {
                        RecurrenceError::InvalidValue {
                            component: "INTERVAL".to_string(),
                            value: value.to_string(),
                        }
                    })?;
                    if interval == 0 {
                        return Err(RecurrenceError::InvalidValue {
                            component: "INTERVAL".to_string(),
                            value: value.to_string(),
                        });
                    }
                }
                "BYHOUR" => {
                    let hour: u32 = value.trim().parse().map_err(|_| {
                        RecurrenceError::InvalidValue {
                            component: "BYHOUR".to_string(),
                            value: value.to_string(),
                        }
                    })?;
                    if hour > 23 {
                        return Err(RecurrenceError::InvalidValue {
                            component: "BYHOUR".to_string(),
                            value: value.to_string(),
                        });
                    }
                    by_hour = Some(hour);
                }
                "BYMINUTE" => {
                    let minute: u32 = value.trim().parse().map_err(|_| {
                        RecurrenceError::InvalidValue {
                            component: "BYMINUTE".to_string(),
                            value: value.to_string(),
                        }
                    })?;
                    if minute > 59 {
                        return Err(RecurrenceError::InvalidValue {
                            component: "BYMINUTE".to_string(),
                            value: value.to_string(),
                        });
                    }
                    by_minute = Some(minute);
                }
                "BYDAY" => {
                    for day in value.split(',') {
                        by_day.push(parse_weekday(day.trim()).ok_or_else(|| {
                            RecurrenceError::InvalidValue {
                                component: "BYDAY".to_string(),
                                value: day.to_string(),
                            }
                        })?);
                    }
                }
                other => {
                    return Err(RecurrenceError::Unsupported {
                        component: other.to_string(),
                        rrule: rrule.to_string(),
                    })
                }
            }
        }

        Ok(Self {
            freq: freq.ok_or_else(|| RecurrenceError::MissingFreq {
                rrule: rrule.to_string(),
            })?,
            interval,
            by_hour,
            by_minute,
            by_day,
        })
    }

    /// Nominal period, used to size the catch-up window.
    pub fn period(&self) -> Duration {
        let interval = i64::from(self.interval);
        match self.freq {
            Freq::Minutely => Duration::minutes(interval),
            Freq::Hourly => Duration::hours(interval),
            Freq::Daily => Duration::days(interval),
            Freq::Weekly => Duration::weeks(interval),
            Freq::Monthly => Duration::days(30 * interval),
        }
    }

    /// First occurrence strictly after `after`, evaluated in `tz`.
    pub fn next_occurrence(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz);
        match self.freq {
            Freq::Minutely => {
                let next = local + Duration::minutes(i64::from(self.interval));
                local_at(&tz, next.year(), next.month(), next.day(), next.hour(), next.minute())
            }
            Freq::Hourly => {
                let minute = self.by_minute.unwrap_or(local.minute());
                let mut candidate = local_at(
                    &tz,
                    local.year(),
                    local.month(),
                    local.day(),
                    local.hour(),
                    minute,
                )?;
                while candidate <= after {
                    let bumped =
                        candidate.with_timezone(&tz) + Duration::hours(i64::from(self.interval));
                    candidate = local_at(
                        &tz,
                        bumped.year(),
                        bumped.month(),
                        bumped.day(),
                        bumped.hour(),
                        minute,
                    )?;
                }
                Some(candidate)
            }
            Freq::Daily => {
                let hour = self.by_hour.unwrap_or(local.hour());
                let minute = self.by_minute.unwrap_or(0);
                let mut date = local.date_naive();
                loop {
                    if let Some(candidate) =
                        local_at(&tz, date.year(), date.month(), date.day(), hour, minute)
                    {
                        if candidate > after {
                            return Some(candidate);
                        }
                    }
                    date = date.checked_add_signed(Duration::days(i64::from(self.interval)))?;
                }
            }
            Freq::Weekly => {
                let hour = self.by_hour.unwrap_or(local.hour());
                let minute = self.by_minute.unwrap_or(0);
                let days: Vec<Weekday> = if self.by_day.is_empty() {
                    vec![local.weekday()]
                } else {
                    self.by_day.clone()
                };
                let mut date = local.date_naive();
                // Scan day by day; the interval stride applies week-wise.
                for _ in 0..(7 * i64::from(self.interval) + 7) {
                    if days.contains(&date.weekday()) {
                        if let Some(candidate) =
                            local_at(&tz, date.year(), date.month(), date.day(), hour, minute)
                        {
                            if candidate > after {
                                return Some(candidate);
                            }
                        }
                    }
                    date = date.succ_opt()?;
                }
                None
            }
            Freq::Monthly => {
                let hour = self.by_hour.unwrap_or(local.hour());
                let minute = self.by_minute.unwrap_or(0);
                let mut anchor = local.date_naive();
                loop {
                    if let Some(candidate) =
                        local_at(&tz, anchor.year(), anchor.month(), anchor.day(), hour, minute)
                    {
                        if candidate > after {
                            return Some(candidate);
                        }
                    }
                    anchor = anchor.checked_add_months(Months::new(self.interval))?;
                }
            }
        }
    }
}

fn parse_weekday(raw: &str) -> Option<Weekday> {
    match raw.to_ascii_uppercase().as_str() {
        "MO" => Some(Weekday::Mon),
        "TU" => Some(Weekday::Tue),
        "WE" => Some(Weekday::Wed),
        "TH" => Some(Weekday::Thu),
        "FR" => Some(Weekday::Fri),
        "SA" => Some(Weekday::Sat),
        "SU" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Resolve a local wall-clock time to UTC. Ambiguous times (DST fall-back)
/// take the earliest mapping; nonexistent times (spring-forward gap) are
/// skipped.
fn local_at(
    tz: &Tz,
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
) -> Option<DateTime<Utc>> {
    tz.with_ymd_and_hms(year, month, day, hour, minute, 0)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Resolve the zone name carried on a timed row. Malformed names fall back
/// to UTC rather than failing the row.
pub fn resolve_timezone(name: Option<&str>) -> Tz {
    name.and_then(|raw| raw.parse().ok()).unwrap_or(chrono_tz::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_daily_with_clock() {
        let rule = Recurrence::parse("FREQ=DAILY;BYHOUR=7;BYMINUTE=0").unwrap();
        assert_eq!(rule.freq, Freq::Daily);
        assert_eq!(rule.by_hour, Some(7));
        assert_eq!(rule.by_minute, Some(0));
    }

    #[test]
    fn parses_weekly_with_byday() {
        let rule = Recurrence::parse("FREQ=WEEKLY;BYDAY=TU;BYHOUR=9;BYMINUTE=0").unwrap();
        assert_eq!(rule.freq, Freq::Weekly);
        assert_eq!(rule.by_day, vec![Weekday::Tue]);
    }

    #[test]
    fn rejects_missing_freq() {
        assert!(Recurrence::parse("INTERVAL=2").is_err());
    }

    #[test]
    fn rejects_zero_interval() {
        assert!(Recurrence::parse("FREQ=DAILY;INTERVAL=0").is_err());
    }

    #[test]
    fn daily_next_occurrence_rolls_to_tomorrow() {
        let rule = Recurrence::parse("FREQ=DAILY;BYHOUR=7;BYMINUTE=0").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 6, 10, 8, 0, 0).unwrap();
        let next = rule.next_occurrence(after, chrono_tz::UTC).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 11, 7, 0, 0).unwrap());
    }

    #[test]
    fn daily_next_occurrence_same_day_when_before_clock() {
        let rule = Recurrence::parse("FREQ=DAILY;BYHOUR=7;BYMINUTE=30").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 6, 10, 5, 0, 0).unwrap();
        let next = rule.next_occurrence(after, chrono_tz::UTC).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 10, 7, 30, 0).unwrap());
    }

    #[test]
    fn weekly_next_occurrence_lands_on_requested_weekday() {
        let rule = Recurrence::parse("FREQ=WEEKLY;BYDAY=TU;BYHOUR=9;BYMINUTE=0").unwrap();
        // 2025-06-10 is a Tuesday.
        let after = Utc.with_ymd_and_hms(2025, 6, 10, 10, 0, 0).unwrap();
        let next = rule.next_occurrence(after, chrono_tz::UTC).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 17, 9, 0, 0).unwrap());
    }

    #[test]
    fn minutely_interval_advances_by_interval() {
        let rule = Recurrence::parse("FREQ=MINUTELY;INTERVAL=5").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 6, 10, 10, 0, 30).unwrap();
        let next = rule.next_occurrence(after, chrono_tz::UTC).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 10, 10, 5, 0).unwrap());
    }

    #[test]
    fn occurrences_respect_local_timezone() {
        let rule = Recurrence::parse("FREQ=DAILY;BYHOUR=7;BYMINUTE=0").unwrap();
        let tz: Tz = "Europe/Amsterdam".parse().unwrap();
        // 05:00 UTC in June is 07:00 CEST, so the occurrence already passed.
        let after = Utc.with_ymd_and_hms(2025, 6, 10, 5, 30, 0).unwrap();
        let next = rule.next_occurrence(after, tz).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 11, 5, 0, 0).unwrap());
    }

    #[test]
    fn period_scales_with_interval() {
        let rule = Recurrence::parse("FREQ=HOURLY;INTERVAL=6").unwrap();
        assert_eq!(rule.period(), Duration::hours(6));
    }
}
