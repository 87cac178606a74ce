//! Clarification state machine.
//!
//! At most one session per owner lives in a [`SessionStore`]. A reply is fed
//! through [`advance`], a pure transition that never touches the store; the
//! caller applies the resulting [`Transition`] while holding the owner's lock.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::intent::{Meridiem, ParseOutcome, TemporalIntent, TimeTarget};
use crate::parser::{ClockTime, Parser};
use crate::recurrence::RecurrenceRule;
use crate::reminder::{OwnerId, describe_rule};
use crate::time::{TimezoneSpec, format_local};

const ASK_TIME: &str = "Во сколько напомнить? Напиши время, например 18:00 или «7 вечера».";
const ASK_WEEKDAY: &str = "В какой день недели напоминать?";
const ASK_PICK: &str = "Уточни, пожалуйста, время:";
const REPEAT_PICK: &str = "Выбери один из вариантов или напиши новую заявку.";

const WEEKDAYS: [(Weekday, &str); 7] = [
    (Weekday::Mon, "Понедельник"),
    (Weekday::Tue, "Вторник"),
    (Weekday::Wed, "Среда"),
    (Weekday::Thu, "Четверг"),
    (Weekday::Fri, "Пятница"),
    (Weekday::Sat, "Суббота"),
    (Weekday::Sun, "Воскресенье"),
];

/// Follow-up question plus the options the transport renders as buttons.
/// A pick refers to an option by its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub text: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl Prompt {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            options: Vec::new(),
        }
    }

    pub fn with_options(text: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            text: text.into(),
            options,
        }
    }
}

/// One selectable answer. Without `at` the label is forwarded as a free-text
/// answer to the fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub label: String,
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Pending {
    WaitingForTime {
        target: TimeTarget,
        meridiem: Option<Meridiem>,
    },
    WaitingForWeekday {
        rule: RecurrenceRule,
        meridiem: Option<Meridiem>,
        #[serde(default)]
        spoken: Option<NaiveTime>,
    },
    WaitingForPick {
        choices: Vec<Choice>,
        rule: Option<RecurrenceRule>,
    },
    /// The fallback asked an open question; the answer goes back to it.
    WaitingForAnswer { question: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationSession {
    pub owner_id: OwnerId,
    pub original_text: String,
    pub pending: Pending,
    pub title: String,
    pub note: Option<String>,
    pub timezone: TimezoneSpec,
    pub created_at: DateTime<Utc>,
}

impl ClarificationSession {
    /// Open a session for a partial or ambiguous outcome. Resolved and
    /// unresolved outcomes do not need one.
    pub fn open(
        owner_id: OwnerId,
        original_text: &str,
        outcome: &ParseOutcome,
        timezone: TimezoneSpec,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let pending = match &outcome.intent {
            TemporalIntent::NeedsTime { target, meridiem } => Pending::WaitingForTime {
                target: target.clone(),
                meridiem: *meridiem,
            },
            TemporalIntent::NeedsWeekday {
                rule,
                meridiem,
                spoken,
            } => Pending::WaitingForWeekday {
                rule: rule.clone(),
                meridiem: *meridiem,
                spoken: *spoken,
            },
            TemporalIntent::Ambiguous { candidates, rule } if candidates.len() >= 2 => {
                Pending::WaitingForPick {
                    choices: candidate_choices(candidates, rule.as_ref(), &timezone),
                    rule: rule.clone(),
                }
            }
            _ => return None,
        };
        Some(Self {
            owner_id,
            original_text: original_text.to_string(),
            pending,
            title: outcome.title.clone(),
            note: outcome.note.clone(),
            timezone,
            created_at: now,
        })
    }

    pub fn prompt(&self) -> Prompt {
        match &self.pending {
            Pending::WaitingForTime { .. } => Prompt::text(ASK_TIME),
            Pending::WaitingForWeekday { .. } => Prompt::with_options(
                ASK_WEEKDAY,
                WEEKDAYS.iter().map(|(_, label)| label.to_string()).collect(),
            ),
            Pending::WaitingForPick { choices, .. } => Prompt::with_options(
                ASK_PICK,
                choices.iter().map(|c| c.label.clone()).collect(),
            ),
            Pending::WaitingForAnswer { question } => Prompt::text(question.clone()),
        }
    }

    /// "Исходная заявка: …\nОтвет на уточнение: …" for the fallback.
    pub fn with_answer(&self, answer: &str) -> String {
        format!(
            "Исходная заявка: {}\nОтвет на уточнение: {}",
            self.original_text, answer
        )
    }

    fn expired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.created_at > max_age
    }
}

fn candidate_choices(
    candidates: &[DateTime<Utc>],
    rule: Option<&RecurrenceRule>,
    tz: &TimezoneSpec,
) -> Vec<Choice> {
    candidates
        .iter()
        .map(|at| {
            let label = match rule {
                Some(rule) => {
                    let local = rule.timezone.to_local(*at).time();
                    describe_rule(&rule.clone().at(local))
                }
                None => format_local(*at, tz),
            };
            Choice {
                label,
                at: Some(*at),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClarifyPolicy {
    pub max_age: Duration,
    /// Drop a pending session when a reply reads as a brand-new request.
    pub supersede_on_new_request: bool,
}

impl Default for ClarifyPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::hours(24),
            supersede_on_new_request: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyInput<'a> {
    Text(&'a str),
    Pick(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The session closes with a resolved intent.
    Complete {
        session: ClarificationSession,
        intent: TemporalIntent,
    },
    /// The session moves to a new waiting state.
    Advance(ClarificationSession),
    /// Reply not understood; the session stays as it was.
    Reprompt(Prompt),
    /// The reply is a new request; the session is dropped and the text parsed fresh.
    Superseded,
    /// The session closes and `text` goes to the fallback.
    AskFallback {
        session: ClarificationSession,
        text: String,
    },
}

/// Feed one reply into a session.
pub fn advance(
    session: ClarificationSession,
    reply: ReplyInput<'_>,
    parser: &Parser,
    now: DateTime<Utc>,
    policy: &ClarifyPolicy,
) -> Transition {
    let tz = session.timezone;
    let supersedes = |text: &str| {
        policy.supersede_on_new_request && parser.looks_like_request(text, now, &tz)
    };

    match (&session.pending, reply) {
        (Pending::WaitingForPick { choices, rule }, ReplyInput::Pick(index)) => {
            let Some(choice) = choices.get(index) else {
                return Transition::Reprompt(session.prompt());
            };
            let Some(at) = choice.at else {
                let text = session.with_answer(&choice.label);
                return Transition::AskFallback { session, text };
            };
            let intent = match rule {
                Some(rule) => {
                    let local = rule.timezone.to_local(at).time();
                    TemporalIntent::Recurring {
                        rule: rule.clone().at(local),
                    }
                }
                None => TemporalIntent::Absolute { at },
            };
            Transition::Complete { session, intent }
        }

        (Pending::WaitingForPick { .. }, ReplyInput::Text(text)) => {
            if supersedes(text) {
                Transition::Superseded
            } else {
                let mut prompt = session.prompt();
                prompt.text = REPEAT_PICK.to_string();
                Transition::Reprompt(prompt)
            }
        }

        (Pending::WaitingForTime { target, meridiem }, ReplyInput::Text(text)) => {
            let Some(clock) = parser.parse_reply_time(text) else {
                return if supersedes(text) {
                    Transition::Superseded
                } else {
                    Transition::Reprompt(session.prompt())
                };
            };
            let intent = parser.complete_time(target, *meridiem, &clock, now, &tz);
            settle(session, intent)
        }

        (
            Pending::WaitingForWeekday {
                rule,
                meridiem,
                spoken,
            },
            reply,
        ) => {
            let days = match reply {
                ReplyInput::Pick(index) => {
                    WEEKDAYS.get(index).map(|(d, _)| vec![*d]).unwrap_or_default()
                }
                ReplyInput::Text(text) => parser.parse_reply_weekdays(text),
            };
            if days.is_empty() {
                return match reply {
                    ReplyInput::Text(text) if supersedes(text) => Transition::Superseded,
                    _ => Transition::Reprompt(session.prompt()),
                };
            }
            let rule = rule.clone().with_weekdays(days);
            let meridiem = *meridiem;
            let spoken = *spoken;
            if !rule.needs_time() {
                return Transition::Complete {
                    session,
                    intent: TemporalIntent::Recurring { rule },
                };
            }
            let target = TimeTarget::Rule { rule };
            match spoken {
                Some(t) => {
                    let clock = ClockTime::new(t.hour(), t.minute(), None);
                    let intent = parser.complete_time(&target, meridiem, &clock, now, &tz);
                    settle(session, intent)
                }
                None => Transition::Advance(ClarificationSession {
                    pending: Pending::WaitingForTime { target, meridiem },
                    ..session
                }),
            }
        }

        (Pending::WaitingForAnswer { .. }, ReplyInput::Text(text)) => {
            if supersedes(text) {
                return Transition::Superseded;
            }
            let text = session.with_answer(text);
            Transition::AskFallback { session, text }
        }

        (_, ReplyInput::Pick(_)) => Transition::Reprompt(session.prompt()),
    }
}

/// Close the session on a resolved intent, or ask to pick between readings.
fn settle(session: ClarificationSession, intent: TemporalIntent) -> Transition {
    match intent {
        intent @ (TemporalIntent::Absolute { .. } | TemporalIntent::Recurring { .. }) => {
            Transition::Complete { session, intent }
        }
        TemporalIntent::Ambiguous { candidates, rule } if candidates.len() >= 2 => {
            let choices = candidate_choices(&candidates, rule.as_ref(), &session.timezone);
            Transition::Advance(ClarificationSession {
                pending: Pending::WaitingForPick { choices, rule },
                ..session
            })
        }
        _ => Transition::Reprompt(session.prompt()),
    }
}

/// Keyed store of live sessions, one per owner.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<OwnerId, ClarificationSession>>,
    policy: ClarifyPolicy,
}

impl SessionStore {
    pub fn new(policy: ClarifyPolicy) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> &ClarifyPolicy {
        &self.policy
    }

    /// The owner's live session. Expired sessions are dropped on access.
    pub fn current(&self, owner: OwnerId, now: DateTime<Utc>) -> Option<ClarificationSession> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = sessions
            .get(&owner)
            .is_some_and(|s| s.expired(now, self.policy.max_age));
        if expired {
            sessions.remove(&owner);
            debug!(owner, "clarification session expired");
            return None;
        }
        sessions.get(&owner).cloned()
    }

    /// Store `session`, replacing whatever the owner had.
    pub fn put(&self, session: ClarificationSession) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(session.owner_id, session);
    }

    pub fn close(&self, owner: OwnerId) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(&owner).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recurrence::Frequency;
    use chrono::{NaiveDate, NaiveTime, TimeZone};

    fn msk() -> TimezoneSpec {
        TimezoneSpec::Fixed(180)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 7, 0, 0).unwrap()
    }

    fn local(d: u32, h: u32) -> DateTime<Utc> {
        msk().from_local(
            NaiveDate::from_ymd_opt(2026, 10, d)
                .unwrap()
                .and_hms_opt(h, 0, 0)
                .unwrap(),
        )
    }

    fn open(text: &str) -> (Parser, ClarificationSession) {
        let parser = Parser::new().unwrap();
        let outcome = parser.parse(text, now(), &msk());
        let session = ClarificationSession::open(1, text, &outcome, msk(), now())
            .expect("partial outcome opens a session");
        (parser, session)
    }

    #[test]
    fn resolved_outcomes_open_nothing() {
        let parser = Parser::new().unwrap();
        let outcome = parser.parse("через 10 минут чай", now(), &msk());
        assert!(ClarificationSession::open(1, "x", &outcome, msk(), now()).is_none());
        let outcome = ParseOutcome::unresolved("x");
        assert!(ClarificationSession::open(1, "x", &outcome, msk(), now()).is_none());
    }

    #[test]
    fn needs_time_completes_with_unambiguous_reply() {
        let (parser, session) = open("послезавтра");
        let policy = ClarifyPolicy::default();
        match advance(session, ReplyInput::Text("18"), &parser, now(), &policy) {
            Transition::Complete { intent, .. } => {
                assert_eq!(intent, TemporalIntent::Absolute { at: local(18, 18) });
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn needs_time_with_ambiguous_reply_asks_to_pick() {
        let (parser, session) = open("послезавтра купить торт");
        let policy = ClarifyPolicy::default();
        let Transition::Advance(next) =
            advance(session, ReplyInput::Text("7"), &parser, now(), &policy)
        else {
            panic!("expected a pick step");
        };
        assert_eq!(next.title, "Купить торт");
        let prompt = next.prompt();
        assert_eq!(prompt.options, vec!["18.10 в 07:00", "18.10 в 19:00"]);

        match advance(next, ReplyInput::Pick(1), &parser, now(), &policy) {
            Transition::Complete { intent, .. } => {
                assert_eq!(intent, TemporalIntent::Absolute { at: local(18, 19) });
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn meridiem_from_request_carries_into_reply() {
        let (parser, session) = open("завтра вечером");
        let policy = ClarifyPolicy::default();
        match advance(session, ReplyInput::Text("8"), &parser, now(), &policy) {
            Transition::Complete { intent, .. } => {
                assert_eq!(intent, TemporalIntent::Absolute { at: local(17, 20) });
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn garbage_reply_reprompts_without_closing() {
        let (parser, session) = open("завтра");
        let policy = ClarifyPolicy::default();
        assert!(matches!(
            advance(session, ReplyInput::Text("ну когда-нибудь"), &parser, now(), &policy),
            Transition::Reprompt(_)
        ));
    }

    #[test]
    fn pick_state_rejects_text_but_yields_to_new_request() {
        let (parser, session) = open("завтра в 7 позвонить");
        let policy = ClarifyPolicy::default();
        assert!(matches!(
            advance(session.clone(), ReplyInput::Text("а?"), &parser, now(), &policy),
            Transition::Reprompt(_)
        ));
        assert_eq!(
            advance(
                session.clone(),
                ReplyInput::Text("через 20 минут чайник"),
                &parser,
                now(),
                &policy
            ),
            Transition::Superseded
        );

        let strict = ClarifyPolicy {
            supersede_on_new_request: false,
            ..ClarifyPolicy::default()
        };
        assert!(matches!(
            advance(session.clone(), ReplyInput::Text("через 20 минут"), &parser, now(), &strict),
            Transition::Reprompt(_)
        ));
        assert!(matches!(
            advance(session, ReplyInput::Pick(5), &parser, now(), &policy),
            Transition::Reprompt(_)
        ));
    }

    #[test]
    fn time_only_reply_is_not_taken_as_new_request() {
        let (parser, session) = open("в пятницу");
        let policy = ClarifyPolicy::default();
        assert!(matches!(
            advance(session, ReplyInput::Text("19"), &parser, now(), &policy),
            Transition::Complete { .. }
        ));
    }

    #[test]
    fn weekday_then_time_then_rule() {
        let (parser, session) = open("каждую неделю уборка");
        assert_eq!(session.prompt().options.len(), 7);
        let policy = ClarifyPolicy::default();

        let Transition::Advance(next) =
            advance(session, ReplyInput::Pick(5), &parser, now(), &policy)
        else {
            panic!("expected time step");
        };
        let Transition::Complete { intent, session } =
            advance(next, ReplyInput::Text("14:30"), &parser, now(), &policy)
        else {
            panic!("expected completion");
        };
        let TemporalIntent::Recurring { rule } = intent else {
            panic!("expected rule");
        };
        assert_eq!(rule.frequency, Frequency::Weekly);
        assert_eq!(rule.weekdays, vec![Weekday::Sat]);
        assert_eq!(rule.time_of_day, NaiveTime::from_hms_opt(14, 30, 0));
        assert_eq!(session.title, "Уборка");
    }

    #[test]
    fn weekday_then_pick_for_ambiguous_hour() {
        let (parser, session) = open("каждую неделю в 10:00 уборка");
        let policy = ClarifyPolicy::default();

        let Transition::Advance(next) =
            advance(session, ReplyInput::Text("по субботам"), &parser, now(), &policy)
        else {
            panic!("expected a pick step");
        };
        assert_eq!(
            next.prompt().options,
            vec!["по субботам в 10:00", "по субботам в 22:00"]
        );
        let Transition::Complete { intent, .. } =
            advance(next, ReplyInput::Pick(1), &parser, now(), &policy)
        else {
            panic!("expected completion");
        };
        let TemporalIntent::Recurring { rule } = intent else {
            panic!("expected rule");
        };
        assert_eq!(rule.weekdays, vec![Weekday::Sat]);
        assert_eq!(rule.time_of_day, NaiveTime::from_hms_opt(22, 0, 0));
    }

    #[test]
    fn ambiguous_rule_pick_fixes_time() {
        let (parser, session) = open("каждый день в 7 зарядка");
        let policy = ClarifyPolicy::default();
        assert_eq!(
            session.prompt().options,
            vec!["каждый день в 19:00", "каждый день в 07:00"]
        );
        let Transition::Complete { intent, .. } =
            advance(session, ReplyInput::Pick(1), &parser, now(), &policy)
        else {
            panic!("expected completion");
        };
        let TemporalIntent::Recurring { rule } = intent else {
            panic!("expected rule");
        };
        assert_eq!(rule.time_of_day, NaiveTime::from_hms_opt(7, 0, 0));
    }

    #[test]
    fn open_question_goes_back_to_fallback_with_context() {
        let parser = Parser::new().unwrap();
        let session = ClarificationSession {
            owner_id: 1,
            original_text: "напомни про врача".into(),
            pending: Pending::WaitingForAnswer {
                question: "Когда?".into(),
            },
            title: "Врач".into(),
            note: None,
            timezone: msk(),
            created_at: now(),
        };
        let Transition::AskFallback { text, .. } = advance(
            session,
            ReplyInput::Text("на следующей неделе"),
            &parser,
            now(),
            &ClarifyPolicy::default(),
        ) else {
            panic!("expected fallback");
        };
        assert_eq!(
            text,
            "Исходная заявка: напомни про врача\nОтвет на уточнение: на следующей неделе"
        );
    }

    #[test]
    fn store_keeps_one_session_per_owner_and_expires() {
        let store = SessionStore::new(ClarifyPolicy::default());
        let (_, first) = open("завтра");
        let (_, second) = open("послезавтра");
        store.put(first);
        store.put(second.clone());
        assert_eq!(store.current(1, now()), Some(second));
        assert!(store.current(1, now() + Duration::hours(25)).is_none());
        assert!(!store.close(1));
    }
}
