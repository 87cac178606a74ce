//! LLM fallback boundary.
//!
//! The engine consults a [`FallbackResolver`] only when the deterministic
//! parser returns `Unresolved`. Resolvers are unreliable by contract, so calls
//! go through [`resolve_with_retry`], which bounds both attempts and time.

use std::future::Future;
use std::time::Duration as StdDuration;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::clarify::Choice;
use crate::error::{Error, Result};
use crate::intent::{ParseOutcome, TemporalIntent, TimeTarget};
use crate::recurrence::RecurrenceRule;
use crate::reminder::normalize_title;
use crate::time::{TimezoneSpec, iso_minutes, parse_instant};

const DEFAULT_QUESTION: &str = "Уточни, пожалуйста.";
const MAX_VARIANTS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackRequest {
    pub text: String,
    pub now: DateTime<Utc>,
    pub timezone: TimezoneSpec,
}

impl FallbackRequest {
    pub fn new(text: impl Into<String>, now: DateTime<Utc>, timezone: TimezoneSpec) -> Self {
        Self {
            text: text.into(),
            now,
            timezone,
        }
    }

    /// Context lines sent ahead of the user text.
    pub fn header(&self) -> String {
        format!(
            "NOW_ISO={}\nTZ_DEFAULT={}",
            iso_minutes(self.now, &self.timezone),
            self.timezone
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReply {
    Outcome(ParseOutcome),
    Clarify {
        question: String,
        choices: Vec<Choice>,
    },
}

pub trait FallbackResolver: Send + Sync {
    fn resolve(
        &self,
        request: &FallbackRequest,
    ) -> impl Future<Output = Result<FallbackReply>> + Send;

    /// False for resolvers that can never answer; callers skip them.
    fn is_available(&self) -> bool {
        true
    }
}

/// Resolver used when no model is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFallback;

impl FallbackResolver for NoFallback {
    async fn resolve(&self, _request: &FallbackRequest) -> Result<FallbackReply> {
        Err(Error::FallbackFailure("no model configured".into()))
    }

    fn is_available(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub per_attempt: StdDuration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            per_attempt: StdDuration::from_secs(30),
        }
    }
}

/// Call `resolver` up to `policy.attempts` times. Timeouts and errors count as
/// failed attempts. An unavailable resolver fails at once.
pub async fn resolve_with_retry<F: FallbackResolver>(
    resolver: &F,
    request: &FallbackRequest,
    policy: RetryPolicy,
) -> Result<FallbackReply> {
    if !resolver.is_available() {
        return Err(Error::FallbackFailure("no model configured".into()));
    }
    let mut last = String::from("no attempts made");
    for attempt in 1..=policy.attempts.max(1) {
        match tokio::time::timeout(policy.per_attempt, resolver.resolve(request)).await {
            Ok(Ok(reply)) => return Ok(reply),
            Ok(Err(e)) => {
                warn!(attempt, error = %e, "fallback attempt failed");
                last = e.to_string();
            }
            Err(_) => {
                warn!(attempt, "fallback attempt timed out");
                last = "timed out".into();
            }
        }
    }
    Err(Error::FallbackFailure(last))
}

#[derive(Debug, Deserialize)]
struct RawPayload {
    intent: String,
    title: Option<String>,
    description: Option<String>,
    fixed_datetime: Option<String>,
    recurrence: Option<RawRecurrence>,
    question: Option<String>,
    #[serde(default)]
    variants: Vec<RawVariant>,
}

#[derive(Debug, Deserialize)]
struct RawRecurrence {
    #[serde(rename = "type")]
    kind: String,
    weekday: Option<Value>,
    day: Option<Value>,
    month: Option<Value>,
    time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawVariant {
    Text(String),
    Choice {
        label: Option<String>,
        text: Option<String>,
        iso_datetime: Option<String>,
    },
}

/// Decode a model reply. The JSON object may be wrapped in prose; the span
/// from the first `{` to the last `}` is used.
pub fn decode_payload(raw: &str, timezone: &TimezoneSpec) -> Result<FallbackReply> {
    let payload: RawPayload = match serde_json::from_str(raw.trim()) {
        Ok(p) => p,
        Err(_) => {
            let start = raw.find('{');
            let end = raw.rfind('}');
            match (start, end) {
                (Some(s), Some(e)) if s < e => serde_json::from_str(&raw[s..=e])?,
                _ => {
                    return Err(Error::FallbackFailure("no JSON object in reply".into()));
                }
            }
        }
    };

    match payload.intent.as_str() {
        "ask_clarification" => {
            let choices = payload
                .variants
                .into_iter()
                .take(MAX_VARIANTS)
                .map(|v| match v {
                    RawVariant::Text(label) => Choice { label, at: None },
                    RawVariant::Choice {
                        label,
                        text,
                        iso_datetime,
                    } => {
                        let at = iso_datetime
                            .as_deref()
                            .and_then(|iso| parse_instant(iso, timezone));
                        let label = label
                            .or(text)
                            .or(iso_datetime)
                            .unwrap_or_else(|| "Выбрать".to_string());
                        Choice { label, at }
                    }
                })
                .collect();
            Ok(FallbackReply::Clarify {
                question: payload
                    .question
                    .filter(|q| !q.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_QUESTION.to_string()),
                choices,
            })
        }
        "create_reminder" => {
            let intent = match (&payload.recurrence, &payload.fixed_datetime) {
                (Some(rec), _) => recurrence_intent(rec, timezone)?,
                (None, Some(iso)) => TemporalIntent::Absolute {
                    at: parse_instant(iso, timezone).ok_or_else(|| {
                        Error::FallbackFailure(format!("bad fixed_datetime {iso:?}"))
                    })?,
                },
                (None, None) => {
                    return Err(Error::FallbackFailure("reminder without a time".into()));
                }
            };
            Ok(FallbackReply::Outcome(ParseOutcome {
                intent,
                title: normalize_title(payload.title.as_deref().unwrap_or_default()),
                note: payload.description.filter(|d| !d.trim().is_empty()),
            }))
        }
        other => Err(Error::FallbackFailure(format!("unknown intent {other:?}"))),
    }
}

fn recurrence_intent(rec: &RawRecurrence, tz: &TimezoneSpec) -> Result<TemporalIntent> {
    let bad = |what: &str| Error::FallbackFailure(format!("recurrence: {what}"));
    let rule = match rec.kind.as_str() {
        "daily" => RecurrenceRule::daily(*tz),
        "weekly" => {
            let days = rec.weekday.as_ref().map(weekdays_of).unwrap_or_default();
            if days.is_empty() {
                let mut rule = RecurrenceRule::weekly([], *tz);
                if let Some(t) = rec.time.as_deref().and_then(clock_of) {
                    rule = rule.at(t);
                }
                return Ok(TemporalIntent::NeedsWeekday {
                    rule,
                    meridiem: None,
                    spoken: None,
                });
            }
            RecurrenceRule::weekly(days, *tz)
        }
        "monthly" => {
            let day = rec
                .day
                .as_ref()
                .and_then(number_of)
                .filter(|d| (1..=31).contains(d))
                .ok_or_else(|| bad("monthly without day"))?;
            RecurrenceRule::monthly(day, *tz)
        }
        "yearly" => {
            let day = rec.day.as_ref().and_then(number_of);
            let month = rec.month.as_ref().and_then(number_of);
            match (month, day) {
                (Some(m), Some(d)) if (1..=12).contains(&m) && (1..=31).contains(&d) => {
                    RecurrenceRule::yearly(m, d, *tz)
                }
                _ => return Err(bad("yearly without month and day")),
            }
        }
        other => return Err(bad(&format!("unknown type {other:?}"))),
    };

    match rec.time.as_deref() {
        Some(text) => {
            let time = clock_of(text).ok_or_else(|| bad(&format!("bad time {text:?}")))?;
            Ok(TemporalIntent::Recurring {
                rule: rule.at(time),
            })
        }
        None => Ok(TemporalIntent::NeedsTime {
            target: TimeTarget::Rule { rule },
            meridiem: None,
        }),
    }
}

fn clock_of(text: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(text.trim(), "%H:%M").ok()
}

fn number_of(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// "mon", "Friday", "пятница", "mon,wed", 0..=6 (Monday first), or a list of those.
fn weekdays_of(value: &Value) -> Vec<Weekday> {
    match value {
        Value::Array(items) => items.iter().flat_map(weekdays_of).collect(),
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .and_then(|n| Weekday::try_from(n).ok())
            .into_iter()
            .collect(),
        Value::String(s) => s
            .split([',', ' '])
            .filter(|t| !t.is_empty())
            .filter_map(weekday_token)
            .collect(),
        _ => Vec::new(),
    }
}

fn weekday_token(token: &str) -> Option<Weekday> {
    const RUSSIAN: [(&str, Weekday); 7] = [
        ("пон", Weekday::Mon),
        ("вто", Weekday::Tue),
        ("сре", Weekday::Wed),
        ("чет", Weekday::Thu),
        ("пят", Weekday::Fri),
        ("суб", Weekday::Sat),
        ("вос", Weekday::Sun),
    ];
    let lower = token.trim().to_lowercase();
    if let Ok(day) = lower.parse::<Weekday>() {
        return Some(day);
    }
    if let Ok(n) = lower.parse::<u8>() {
        return Weekday::try_from(n).ok();
    }
    RUSSIAN
        .iter()
        .find(|(stem, _)| lower.starts_with(stem))
        .map(|(_, day)| *day)
}
