/*!
Cron-like cadences and the per-tier schedule table.

A [`Cadence`] is a five-field cron expression (`minute hour day-of-month month
day-of-week`, evaluated in UTC) or one of the aliases `daily`, `weekly`,
`monthly`, `hourly`. [`next_fire`] is a pure function of the last fire, the
cadence and the current time; the [`ScheduleTable`] applies it once per poll.

Missed fires collapse: a tier whose process was down for a week fires once
when it comes back, then resumes its normal cadence.
*/

use chrono::{DateTime, Datelike, Duration, DurationRound, NaiveDate, TimeZone, Timelike, Utc};
use std::collections::BTreeMap;
use std::fmt;

use crate::job::Tier;
use crate::{BackupError, Result};

/// Upper bound on the search for the next matching minute
const MAX_SEARCH_STEPS: usize = 200_000;

/// A parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cadence {
    expr: String,
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

fn parse_field(field: &str, min: u32, max: u32, label: &str) -> Result<(u64, bool)> {
    let invalid = |detail: &str| {
        BackupError::config(format!("invalid {label} field '{field}': {detail}"))
    };
    let mut bits = 0u64;
    let restricted = field != "*";

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid("bad step"))?;
                if step == 0 {
                    return Err(invalid("step must be positive"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a.parse().map_err(|_| invalid("bad range start"))?;
            let b: u32 = b.parse().map_err(|_| invalid("bad range end"))?;
            (a, b)
        } else {
            let value: u32 = range.parse().map_err(|_| invalid("not a number"))?;
            // `5/15` means from 5 to the end in steps of 15
            if step > 1 {
                (value, max)
            } else {
                (value, value)
            }
        };

        if start < min || end > max || start > end {
            return Err(invalid(&format!("values must lie within {min}-{max}")));
        }
        for value in (start..=end).step_by(step as usize) {
            bits |= 1 << value;
        }
    }
    Ok((bits, restricted))
}

impl Cadence {
    /// Parse a cron expression or alias
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let canonical = match trimmed.trim_start_matches('@') {
            "hourly" => "0 * * * *",
            "daily" => "0 2 * * *",
            "weekly" => "0 3 * * 0",
            "monthly" => "0 4 1 * *",
            _ => trimmed,
        };

        let fields: Vec<&str> = canonical.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(BackupError::config(format!(
                "cadence '{expr}' must have 5 fields (minute hour day month weekday)"
            )));
        }

        let (minutes, _) = parse_field(fields[0], 0, 59, "minute")?;
        let (hours, _) = parse_field(fields[1], 0, 23, "hour")?;
        let (days_of_month, dom_restricted) = parse_field(fields[2], 1, 31, "day-of-month")?;
        let (months, _) = parse_field(fields[3], 1, 12, "month")?;
        let (mut days_of_week, dow_restricted) = parse_field(fields[4], 0, 7, "day-of-week")?;
        // 7 is an alias for Sunday
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week | 1) & !(1 << 7);
        }

        let cadence = Self {
            expr: trimmed.to_string(),
            minutes,
            hours: hours as u32,
            days_of_month: days_of_month as u32,
            months: months as u16,
            days_of_week: days_of_week as u8,
            dom_restricted,
            dow_restricted,
        };

        let epoch = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).single();
        if epoch.and_then(|t| cadence.next_after(t)).is_none() {
            return Err(BackupError::config(format!(
                "cadence '{expr}' never fires"
            )));
        }
        Ok(cadence)
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month & (1 << date.day()) != 0;
        let dow = self.days_of_week & (1 << date.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First matching minute strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.duration_trunc(Duration::minutes(1)).ok()? + Duration::minutes(1);

        for _ in 0..MAX_SEARCH_STEPS {
            if self.months & (1 << t.month()) == 0 {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = start_of_day(t)? + Duration::days(1);
                continue;
            }
            if self.hours & (1 << t.hour()) == 0 {
                t = t.duration_trunc(Duration::hours(1)).ok()? + Duration::hours(1);
                continue;
            }
            if self.minutes & (1 << t.minute()) == 0 {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

fn start_of_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
        .single()
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)
    }
}

/// When a tier should next fire
///
/// Without a previous fire the first run is the next cadence point after `now`.
/// Otherwise it is the first cadence point after `last_fire`, which may already
/// be in the past: that is the single catch-up run.
pub fn next_fire(
    last_fire: Option<DateTime<Utc>>,
    cadence: &Cadence,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    cadence.next_after(last_fire.unwrap_or(now))
}

#[derive(Debug, Clone)]
struct ScheduleEntry {
    cadence: Cadence,
    last_fire: Option<DateTime<Utc>>,
    next_fire: Option<DateTime<Utc>>,
}

/// Tier to next-fire table driven by the poll loop
#[derive(Debug, Clone, Default)]
pub struct ScheduleTable {
    entries: BTreeMap<Tier, ScheduleEntry>,
}

impl ScheduleTable {
    /// Build the table from configured cadences and persisted last fires
    pub fn new(
        cadences: Vec<(Tier, Cadence)>,
        last_fires: &BTreeMap<Tier, DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let entries = cadences
            .into_iter()
            .map(|(tier, cadence)| {
                let last_fire = last_fires.get(&tier).copied();
                let next = next_fire(last_fire, &cadence, now);
                (
                    tier,
                    ScheduleEntry {
                        cadence,
                        last_fire,
                        next_fire: next,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tiers due at `now`; each due tier is advanced past `now`
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Tier> {
        let mut due = Vec::new();
        for (tier, entry) in self.entries.iter_mut() {
            if entry.next_fire.is_some_and(|at| at <= now) {
                due.push(*tier);
                entry.last_fire = Some(now);
                entry.next_fire = next_fire(Some(now), &entry.cadence, now);
            }
        }
        due
    }

    pub fn next_fires(&self) -> BTreeMap<Tier, Option<DateTime<Utc>>> {
        self.entries
            .iter()
            .map(|(tier, entry)| (*tier, entry.next_fire))
            .collect()
    }

    /// Last fire per tier, for persistence across restarts
    pub fn last_fires(&self) -> BTreeMap<Tier, DateTime<Utc>> {
        self.entries
            .iter()
            .filter_map(|(tier, entry)| entry.last_fire.map(|at| (*tier, at)))
            .collect()
    }
}
