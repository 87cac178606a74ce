//! Reminder model and its human-facing descriptions.

use chrono::{DateTime, Duration, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::recurrence::{Frequency, IntervalUnit, RecurrenceRule};
use crate::time::{TimezoneSpec, format_local};

pub type OwnerId = i64;

pub const DEFAULT_TITLE: &str = "Напоминание";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReminderStatus {
    Scheduled,
    Done,
    Canceled,
    /// The stored rule can no longer produce an occurrence.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Trigger {
    Once {
        next_fire: DateTime<Utc>,
    },
    Recurring {
        rule: RecurrenceRule,
        next_fire: DateTime<Utc>,
    },
}

impl Trigger {
    pub fn next_fire(&self) -> DateTime<Utc> {
        match self {
            Trigger::Once { next_fire } | Trigger::Recurring { next_fire, .. } => *next_fire,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub owner_id: OwnerId,
    pub title: String,
    #[serde(default)]
    pub note: Option<String>,
    pub timezone: TimezoneSpec,
    pub trigger: Trigger,
    pub status: ReminderStatus,
    /// Last delivery attempt. A one-shot whose `next_fire` is not after this
    /// has been delivered and waits for done or snooze.
    #[serde(default)]
    pub last_fired: Option<DateTime<Utc>>,
    /// Pending extra fire of a snoozed recurring reminder.
    #[serde(default)]
    pub snoozed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reminder {
    pub fn once(
        owner_id: OwnerId,
        title: &str,
        timezone: TimezoneSpec,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(owner_id, title, timezone, Trigger::Once { next_fire: at }, now)
    }

    pub fn recurring(
        owner_id: OwnerId,
        title: &str,
        rule: RecurrenceRule,
        next_fire: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let timezone = rule.timezone;
        Self::new(owner_id, title, timezone, Trigger::Recurring { rule, next_fire }, now)
    }

    fn new(
        owner_id: OwnerId,
        title: &str,
        timezone: TimezoneSpec,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id,
            title: normalize_title(title),
            note: None,
            timezone,
            trigger,
            status: ReminderStatus::Scheduled,
            last_fired: None,
            snoozed_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_note(mut self, note: Option<String>) -> Self {
        self.note = note.filter(|n| !n.trim().is_empty());
        self
    }

    pub fn next_fire(&self) -> DateTime<Utc> {
        self.trigger.next_fire()
    }

    pub fn rule(&self) -> Option<&RecurrenceRule> {
        match &self.trigger {
            Trigger::Recurring { rule, .. } => Some(rule),
            Trigger::Once { .. } => None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.rule().is_some()
    }

    pub fn is_scheduled(&self) -> bool {
        self.status == ReminderStatus::Scheduled
    }

    pub fn set_next_fire(&mut self, at: DateTime<Utc>, now: DateTime<Utc>) {
        match &mut self.trigger {
            Trigger::Once { next_fire } | Trigger::Recurring { next_fire, .. } => *next_fire = at,
        }
        self.updated_at = now;
    }

    pub fn mark_fired(&mut self, now: DateTime<Utc>) {
        self.last_fired = Some(now);
        self.updated_at = now;
    }

    /// One-shot that already went off and has not been snoozed since.
    pub fn awaiting_ack(&self) -> bool {
        !self.is_recurring() && self.last_fired.is_some_and(|fired| fired >= self.next_fire())
    }

    pub fn mark_done(&mut self, now: DateTime<Utc>) {
        self.status = ReminderStatus::Done;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.status = ReminderStatus::Failed;
        self.snoozed_until = None;
        self.updated_at = now;
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = ReminderStatus::Canceled;
        self.updated_at = now;
    }

    /// "16.10 в 19:00" or "каждый день в 09:00".
    pub fn describe_schedule(&self) -> String {
        match &self.trigger {
            Trigger::Once { next_fire } => format_local(*next_fire, &self.timezone),
            Trigger::Recurring { rule, .. } => describe_rule(rule),
        }
    }
}

/// Trimmed title with the first letter capitalized; empty becomes the default.
pub fn normalize_title(raw: &str) -> String {
    let trimmed = raw
        .trim_matches(|c: char| c.is_whitespace() || ",.;:!-—–".contains(c))
        .trim();
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => DEFAULT_TITLE.to_string(),
    }
}

pub fn describe_rule(rule: &RecurrenceRule) -> String {
    let at = rule
        .time_of_day
        .map(|t| format!(" в {}", t.format("%H:%M")))
        .unwrap_or_default();
    match rule.frequency {
        Frequency::Daily => format!("каждый день{at}"),
        Frequency::Weekly => {
            if rule.weekdays.is_empty() {
                format!("каждую неделю{at}")
            } else {
                let days: Vec<&str> = rule.weekdays.iter().map(|d| weekday_plural(*d)).collect();
                format!("по {}{at}", days.join(", "))
            }
        }
        Frequency::Monthly => format!(
            "каждое {}-е число{at}",
            rule.day_of_month.unwrap_or(1)
        ),
        Frequency::Yearly => format!(
            "каждый год {:02}.{:02}{at}",
            rule.day_of_month.unwrap_or(1),
            rule.month.unwrap_or(1)
        ),
        Frequency::Interval => match rule.interval {
            Some(i) => {
                let unit = match i.unit {
                    IntervalUnit::Second => "сек.",
                    IntervalUnit::Minute => "мин.",
                    IntervalUnit::Hour => "ч.",
                };
                format!("каждые {} {unit}", i.every)
            }
            None => "периодически".to_string(),
        },
    }
}

fn weekday_plural(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "понедельникам",
        Weekday::Tue => "вторникам",
        Weekday::Wed => "средам",
        Weekday::Thu => "четвергам",
        Weekday::Fri => "пятницам",
        Weekday::Sat => "субботам",
        Weekday::Sun => "воскресеньям",
    }
}

/// Button attached to a delivered notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NotificationAction {
    Snooze { minutes: i64 },
    Done,
}

/// What the transport shows when a reminder fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub reminder_id: String,
    pub owner_id: OwnerId,
    pub title: String,
    pub note: Option<String>,
    pub recurring: bool,
    pub actions: Vec<NotificationAction>,
}

impl NotificationPayload {
    pub fn for_reminder(reminder: &Reminder, snooze_presets: &[Duration]) -> Self {
        let mut actions: Vec<NotificationAction> = snooze_presets
            .iter()
            .map(|d| NotificationAction::Snooze {
                minutes: d.num_minutes(),
            })
            .collect();
        if !reminder.is_recurring() {
            actions.push(NotificationAction::Done);
        }
        Self {
            reminder_id: reminder.id.clone(),
            owner_id: reminder.owner_id,
            title: reminder.title.clone(),
            note: reminder.note.clone(),
            recurring: reminder.is_recurring(),
            actions,
        }
    }

    pub fn text(&self) -> String {
        match &self.note {
            Some(note) => format!("🔔 «{}»\n{}", self.title, note),
            None => format!("🔔 «{}»", self.title),
        }
    }
}
