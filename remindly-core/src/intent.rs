//! Typed temporal intents: what the parser (or the LLM fallback) understood.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recurrence::RecurrenceRule;

/// Part-of-day marker that disambiguates a 12-hour clock value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Meridiem {
    Morning,
    Day,
    Evening,
    Night,
}

impl Meridiem {
    /// Map a spoken hour onto the 24-hour clock. Hours already past noon are kept.
    pub fn apply(self, hour: u32) -> u32 {
        if hour >= 13 {
            return hour;
        }
        match self {
            Meridiem::Morning => hour % 12,
            Meridiem::Day => {
                if hour <= 6 {
                    hour + 12
                } else {
                    hour
                }
            }
            Meridiem::Evening => (hour % 12) + 12,
            Meridiem::Night => {
                if hour == 12 {
                    0
                } else if hour >= 6 {
                    hour + 12
                } else {
                    hour
                }
            }
        }
    }
}

/// What a missing time of day will complete once the owner supplies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeTarget {
    /// A one-shot reminder on this local date.
    Date { date: NaiveDate },
    /// A recurring rule that still lacks `time_of_day`.
    Rule { rule: RecurrenceRule },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TemporalIntent {
    Absolute {
        at: DateTime<Utc>,
    },
    Relative {
        reference: DateTime<Utc>,
        #[serde(with = "duration_secs")]
        delta: Duration,
    },
    Recurring {
        rule: RecurrenceRule,
    },
    /// Day is known, time is not.
    NeedsTime {
        target: TimeTarget,
        meridiem: Option<Meridiem>,
    },
    /// Weekly cadence without a weekday; the time may already be known.
    NeedsWeekday {
        rule: RecurrenceRule,
        meridiem: Option<Meridiem>,
        /// Clock time as written when its hour is still ambiguous.
        #[serde(default)]
        spoken: Option<NaiveTime>,
    },
    /// Two or more instants, soonest first. With `rule`, the picked candidate's
    /// wall-clock time becomes the rule's time of day.
    Ambiguous {
        candidates: Vec<DateTime<Utc>>,
        rule: Option<RecurrenceRule>,
    },
    Unresolved,
}

impl TemporalIntent {
    /// Instant of a one-shot intent, if this intent is one.
    pub fn fire_at(&self) -> Option<DateTime<Utc>> {
        match self {
            TemporalIntent::Absolute { at } => Some(*at),
            TemporalIntent::Relative { reference, delta } => reference.checked_add_signed(*delta),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            TemporalIntent::Absolute { .. }
                | TemporalIntent::Relative { .. }
                | TemporalIntent::Recurring { .. }
        )
    }
}

/// Parser result: an intent plus the text left over once temporal words are gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseOutcome {
    pub intent: TemporalIntent,
    pub title: String,
    #[serde(default)]
    pub note: Option<String>,
}

impl ParseOutcome {
    pub fn unresolved(title: impl Into<String>) -> Self {
        Self {
            intent: TemporalIntent::Unresolved,
            title: title.into(),
            note: None,
        }
    }
}

/// Local wall-clock time from an hour and minute already validated by the caller.
pub fn time_of_day(hour: u32, minute: u32) -> Option<NaiveTime> {
    NaiveTime::from_hms_opt(hour, minute, 0)
}

mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = i64::deserialize(d)?;
        Duration::try_seconds(secs)
            .ok_or_else(|| serde::de::Error::custom(format!("duration out of range: {secs}s")))
    }
}
