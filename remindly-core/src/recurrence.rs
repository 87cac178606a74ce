//! Recurrence rules and next-occurrence evaluation.
//!
//! Field arithmetic (day, weekday, month) happens on wall-clock dates in the
//! rule's zone; every candidate is converted back to UTC on its own, so a named
//! zone's offset is re-resolved per candidate and DST shifts never leak across
//! steps. Interval rules step in absolute time from their anchor.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::time::{TimezoneSpec, clamped_date};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Interval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Second,
    Minute,
    Hour,
}

impl IntervalUnit {
    pub fn seconds(self) -> i64 {
        match self {
            IntervalUnit::Second => 1,
            IntervalUnit::Minute => 60,
            IntervalUnit::Hour => 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub unit: IntervalUnit,
    pub every: u32,
}

impl Interval {
    pub fn step(&self) -> Duration {
        Duration::seconds(self.unit.seconds() * i64::from(self.every))
    }
}

/// Declarative repeating cadence.
///
/// `time_of_day` drives every frequency except `Interval`, which steps from
/// `anchor` by `interval` and ignores the wall clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    #[serde(default)]
    pub time_of_day: Option<NaiveTime>,
    /// Empty means "the reference's own weekday".
    #[serde(default)]
    pub weekdays: Vec<Weekday>,
    #[serde(default)]
    pub day_of_month: Option<u32>,
    #[serde(default)]
    pub month: Option<u32>,
    #[serde(default)]
    pub interval: Option<Interval>,
    #[serde(default)]
    pub anchor: Option<DateTime<Utc>>,
    pub timezone: TimezoneSpec,
}

impl RecurrenceRule {
    fn base(frequency: Frequency, timezone: TimezoneSpec) -> Self {
        Self {
            frequency,
            time_of_day: None,
            weekdays: Vec::new(),
            day_of_month: None,
            month: None,
            interval: None,
            anchor: None,
            timezone,
        }
    }

    pub fn daily(timezone: TimezoneSpec) -> Self {
        Self::base(Frequency::Daily, timezone)
    }

    pub fn weekly(weekdays: impl IntoIterator<Item = Weekday>, timezone: TimezoneSpec) -> Self {
        Self::base(Frequency::Weekly, timezone).with_weekdays(weekdays)
    }

    pub fn monthly(day_of_month: u32, timezone: TimezoneSpec) -> Self {
        let mut rule = Self::base(Frequency::Monthly, timezone);
        rule.day_of_month = Some(day_of_month);
        rule
    }

    pub fn yearly(month: u32, day_of_month: u32, timezone: TimezoneSpec) -> Self {
        let mut rule = Self::base(Frequency::Yearly, timezone);
        rule.month = Some(month);
        rule.day_of_month = Some(day_of_month);
        rule
    }

    pub fn every(interval: Interval, anchor: DateTime<Utc>, timezone: TimezoneSpec) -> Self {
        let mut rule = Self::base(Frequency::Interval, timezone);
        rule.interval = Some(interval);
        rule.anchor = Some(anchor);
        rule
    }

    pub fn at(mut self, time: NaiveTime) -> Self {
        self.time_of_day = Some(time);
        self
    }

    /// Weekdays are kept sorted Monday-first and deduplicated.
    pub fn with_weekdays(mut self, weekdays: impl IntoIterator<Item = Weekday>) -> Self {
        let mut days: Vec<Weekday> = weekdays.into_iter().collect();
        days.sort_by_key(|d| d.num_days_from_monday());
        days.dedup();
        self.weekdays = days;
        self
    }

    /// True when the rule still lacks the time of day its frequency needs.
    pub fn needs_time(&self) -> bool {
        self.frequency != Frequency::Interval && self.time_of_day.is_none()
    }
}

/// Next trigger instant strictly after `reference`.
pub fn next_occurrence(rule: &RecurrenceRule, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if rule.frequency == Frequency::Interval {
        return next_interval(rule, reference);
    }

    let time = rule
        .time_of_day
        .ok_or_else(|| Error::InvalidRule(format!("{:?} rule without time of day", rule.frequency)))?;
    let tz = rule.timezone;
    let today = tz.to_local(reference).date();
    let fire = |date: NaiveDate| tz.from_local(date.and_time(time));

    match rule.frequency {
        Frequency::Daily => (0..=2)
            .map(|offset| fire(today + Duration::days(offset)))
            .find(|candidate| *candidate > reference)
            .ok_or_else(|| Error::InvalidRule("daily rule produced no future instant".into())),

        Frequency::Weekly => {
            let wanted: Vec<Weekday> = if rule.weekdays.is_empty() {
                vec![today.weekday()]
            } else {
                rule.weekdays.clone()
            };
            (0..=14)
                .map(|offset| today + Duration::days(offset))
                .filter(|date| wanted.contains(&date.weekday()))
                .map(fire)
                .find(|candidate| *candidate > reference)
                .ok_or_else(|| Error::InvalidRule("weekly rule produced no future instant".into()))
        }

        Frequency::Monthly => {
            let day = rule
                .day_of_month
                .filter(|d| (1..=31).contains(d))
                .ok_or_else(|| Error::InvalidRule("monthly rule needs day_of_month 1..=31".into()))?;
            (0..=12)
                .filter_map(|k| {
                    let (y, m) = add_months(today.year(), today.month(), k);
                    clamped_date(y, m, day)
                })
                .map(fire)
                .find(|candidate| *candidate > reference)
                .ok_or_else(|| Error::InvalidRule("monthly rule produced no future instant".into()))
        }

        Frequency::Yearly => {
            let month = rule
                .month
                .filter(|m| (1..=12).contains(m))
                .ok_or_else(|| Error::InvalidRule("yearly rule needs month 1..=12".into()))?;
            let day = rule
                .day_of_month
                .filter(|d| (1..=31).contains(d))
                .ok_or_else(|| Error::InvalidRule("yearly rule needs day_of_month 1..=31".into()))?;
            (0..=2)
                .filter_map(|k| clamped_date(today.year() + k, month, day))
                .map(fire)
                .find(|candidate| *candidate > reference)
                .ok_or_else(|| Error::InvalidRule("yearly rule produced no future instant".into()))
        }

        Frequency::Interval => next_interval(rule, reference),
    }
}

fn next_interval(rule: &RecurrenceRule, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let interval = rule
        .interval
        .filter(|i| i.every > 0)
        .ok_or_else(|| Error::InvalidRule("interval rule needs a positive step".into()))?;
    let anchor = rule
        .anchor
        .ok_or_else(|| Error::InvalidRule("interval rule without anchor".into()))?;
    if anchor > reference {
        return Ok(anchor);
    }
    let step = interval.step().num_seconds();
    let elapsed = (reference - anchor).num_seconds();
    let k = elapsed / step + 1;
    k.checked_mul(step)
        .and_then(Duration::try_seconds)
        .and_then(|offset| anchor.checked_add_signed(offset))
        .ok_or_else(|| Error::InvalidRule("interval step runs past the calendar".into()))
}

fn add_months(year: i32, month: u32, k: u32) -> (i32, u32) {
    let zero_based = month - 1 + k;
    (year + (zero_based / 12) as i32, zero_based % 12 + 1)
}
