//! Transport-facing facade.
//!
//! `Assistant` owns the parser, the clarification sessions and the scheduler,
//! and talks to storage and the LLM fallback through their traits. Handlers
//! for one owner are serialized by an owner lock; anything touching a single
//! reminder's jobs takes that reminder's lock.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::clarify::{
    self, ClarificationSession, ClarifyPolicy, Pending, Prompt, ReplyInput, SessionStore,
    Transition,
};
use crate::error::{Error, Result};
use crate::fallback::{FallbackReply, FallbackRequest, FallbackResolver, RetryPolicy, resolve_with_retry};
use crate::intent::{ParseOutcome, TemporalIntent};
use crate::locks::KeyedLocks;
use crate::parser::Parser;
use crate::recurrence::next_occurrence;
use crate::reminder::{DEFAULT_TITLE, NotificationPayload, OwnerId, Reminder, describe_rule};
use crate::scheduler::{FireEvent, Reconciled, Scheduler, SchedulerPolicy};
use crate::store::ReminderStore;
use crate::time::{Clock, TimezoneSpec, format_local};

const REPHRASE: &str = "Не понял, когда напомнить. Напиши, например: «завтра в 15 позвонить маме».";
const TIME_PASSED: &str = "Это время уже прошло. Укажи время в будущем.";
const NOTHING_TO_PICK: &str = "Сейчас нечего выбирать. Напиши новую заявку.";

/// What the transport shows in answer to a message or a button press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Prompt(Prompt),
    Confirmation { reminder_id: String, text: String },
}

impl Reply {
    pub fn text(&self) -> &str {
        match self {
            Reply::Prompt(p) => &p.text,
            Reply::Confirmation { text, .. } => text,
        }
    }

    fn prompt(text: &str) -> Self {
        Reply::Prompt(Prompt::text(text))
    }
}

/// Delivers a fired reminder to its owner.
pub trait Notifier: Send + Sync {
    fn deliver(&self, payload: &NotificationPayload) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantConfig {
    pub clarify: ClarifyPolicy,
    pub scheduler: SchedulerPolicy,
    pub retry: RetryPolicy,
    pub snooze_presets: Vec<Duration>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            clarify: ClarifyPolicy::default(),
            scheduler: SchedulerPolicy::default(),
            retry: RetryPolicy::default(),
            snooze_presets: vec![Duration::minutes(10), Duration::minutes(60)],
        }
    }
}

pub struct Assistant<S, F> {
    parser: Parser,
    sessions: SessionStore,
    scheduler: Scheduler,
    store: S,
    fallback: F,
    clock: Arc<dyn Clock>,
    owners: KeyedLocks<OwnerId>,
    reminders: KeyedLocks<String>,
    retry: RetryPolicy,
    snooze_presets: Vec<Duration>,
}

impl<S: ReminderStore, F: FallbackResolver> Assistant<S, F> {
    /// Build the assistant. Fire events arrive on the returned receiver and
    /// should be fed to [`Assistant::run_fire_loop`].
    pub fn new(
        store: S,
        fallback: F,
        clock: Arc<dyn Clock>,
        config: AssistantConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<FireEvent>)> {
        let (scheduler, events) = Scheduler::new(clock.clone(), config.scheduler);
        let assistant = Self {
            parser: Parser::new()?,
            sessions: SessionStore::new(config.clarify),
            scheduler,
            store,
            fallback,
            clock,
            owners: KeyedLocks::new(),
            reminders: KeyedLocks::new(),
            retry: config.retry,
            snooze_presets: config.snooze_presets,
        };
        Ok((assistant, events))
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn fallback(&self) -> &F {
        &self.fallback
    }

    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    pub fn snooze_presets(&self) -> &[Duration] {
        &self.snooze_presets
    }

    /// Free text from the owner: a reply to an open clarification or a new request.
    pub async fn on_text(&self, owner: OwnerId, text: &str, tz: TimezoneSpec) -> Result<Reply> {
        let _owner = self.owners.lock(&owner).await;
        let now = self.clock.now();

        if let Some(session) = self.sessions.current(owner, now) {
            let policy = *self.sessions.policy();
            let step = clarify::advance(session, ReplyInput::Text(text), &self.parser, now, &policy);
            if step == Transition::Superseded {
                self.sessions.close(owner);
                info!(owner, "clarification superseded by a new request");
            } else {
                return self.apply(owner, step, now).await;
            }
        }

        let outcome = self.parser.parse(text, now, &tz);
        if outcome.intent == TemporalIntent::Unresolved {
            return self
                .consult_fallback(owner, text, text, outcome.title, tz, now)
                .await;
        }
        self.handle_outcome(owner, text, outcome, tz, now).await
    }

    /// Button press on a clarification option.
    pub async fn on_pick(&self, owner: OwnerId, index: usize) -> Result<Reply> {
        let _owner = self.owners.lock(&owner).await;
        let now = self.clock.now();
        let Some(session) = self.sessions.current(owner, now) else {
            return Ok(Reply::prompt(NOTHING_TO_PICK));
        };
        let policy = *self.sessions.policy();
        let step = clarify::advance(session, ReplyInput::Pick(index), &self.parser, now, &policy);
        self.apply(owner, step, now).await
    }

    /// Drop the owner's open clarification, if any.
    pub async fn cancel_clarification(&self, owner: OwnerId) -> bool {
        let _owner = self.owners.lock(&owner).await;
        self.sessions.close(owner)
    }

    /// Claim a fire event, run the fire transition and build the notification.
    /// Returns `None` for stale events and reminders no longer scheduled.
    pub async fn on_fire_callback(&self, event: &FireEvent) -> Result<Option<NotificationPayload>> {
        if !self.scheduler.accept(event) {
            return Ok(None);
        }
        let _guard = self.reminders.lock(&event.reminder_id).await;
        let Some(mut reminder) = self.store.load(&event.reminder_id)? else {
            warn!(reminder_id = %event.reminder_id, "fired reminder is gone");
            return Ok(None);
        };
        if !reminder.is_scheduled() {
            return Ok(None);
        }
        if let Err(e) = self.scheduler.on_fire(event, &mut reminder) {
            warn!(reminder_id = %reminder.id, error = %e, "no next occurrence; reminder marked failed");
            self.scheduler.cancel(&reminder.id);
            reminder.mark_failed(self.clock.now());
        }
        self.store.save(&reminder)?;
        info!(reminder_id = %reminder.id, owner = reminder.owner_id, "reminder fired");
        Ok(Some(NotificationPayload::for_reminder(
            &reminder,
            &self.snooze_presets,
        )))
    }

    /// Fire transition first, then delivery. A failed delivery is logged and
    /// not retried; the reminder has already advanced.
    pub async fn handle_fire<N: Notifier>(&self, event: &FireEvent, notifier: &N) -> Result<()> {
        let Some(payload) = self.on_fire_callback(event).await? else {
            return Ok(());
        };
        if let Err(e) = notifier.deliver(&payload).await {
            warn!(reminder_id = %payload.reminder_id, error = %e, "delivery failed");
        }
        Ok(())
    }

    /// Drain fire events until the scheduler goes away.
    pub async fn run_fire_loop<N: Notifier>(
        &self,
        mut events: mpsc::UnboundedReceiver<FireEvent>,
        notifier: N,
    ) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_fire(&event, &notifier).await {
                warn!(reminder_id = %event.reminder_id, error = %e, "fire handling failed");
            }
        }
    }

    /// Reload every scheduled reminder and arm its job. Returns the job count.
    /// Reminders that cannot be armed are marked failed and skipped.
    pub async fn reconcile_on_startup(&self) -> Result<usize> {
        let active = self.store.list_all_active()?;
        let total = active.len();
        let Reconciled { changed, failed } = self.scheduler.reconcile_on_startup(active);
        for reminder in &changed {
            if let Err(e) = self.store.save(reminder) {
                warn!(reminder_id = %reminder.id, error = %e, "could not save reconciled reminder");
            }
        }
        info!(total, changed = changed.len(), failed, "reminders reconciled");
        Ok(self.scheduler.active_jobs())
    }

    pub fn list(&self, owner: OwnerId) -> Result<Vec<Reminder>> {
        self.store.list_active(owner)
    }

    /// Mark done and drop all jobs. `key` is an id or a unique id prefix.
    pub async fn done(&self, owner: OwnerId, key: &str) -> Result<Reminder> {
        let id = self.resolve_id(owner, key)?;
        let _guard = self.reminders.lock(&id).await;
        let mut reminder = self.load_owned(owner, &id)?;
        reminder.mark_done(self.clock.now());
        self.scheduler.cancel(&id);
        self.store.save(&reminder)?;
        info!(reminder_id = %id, owner, "reminder done");
        Ok(reminder)
    }

    /// Remove the reminder and all its jobs.
    pub async fn delete(&self, owner: OwnerId, key: &str) -> Result<Reminder> {
        let id = self.resolve_id(owner, key)?;
        let _guard = self.reminders.lock(&id).await;
        let reminder = self.load_owned(owner, &id)?;
        self.scheduler.cancel(&id);
        self.store.delete(&id)?;
        info!(reminder_id = %id, owner, "reminder deleted");
        Ok(reminder)
    }

    pub async fn snooze(&self, owner: OwnerId, key: &str, delta: Duration) -> Result<Reply> {
        let id = self.resolve_id(owner, key)?;
        let _guard = self.reminders.lock(&id).await;
        let mut reminder = self.load_owned(owner, &id)?;
        let at = self.scheduler.snooze(&mut reminder, delta);
        self.store.save(&reminder)?;
        info!(reminder_id = %id, %at, "reminder snoozed");
        Ok(Reply::Confirmation {
            text: format!(
                "⏰ Напомню ещё раз «{}» {}",
                reminder.title,
                format_local(at, &reminder.timezone)
            ),
            reminder_id: id,
        })
    }

    async fn apply(&self, owner: OwnerId, step: Transition, now: DateTime<Utc>) -> Result<Reply> {
        match step {
            Transition::Complete { session, intent } => {
                self.sessions.close(owner);
                self.create(owner, &session.title, session.note, session.timezone, intent, now)
                    .await
            }
            Transition::Advance(session) => {
                let prompt = session.prompt();
                self.sessions.put(session);
                Ok(Reply::Prompt(prompt))
            }
            Transition::Reprompt(prompt) => Ok(Reply::Prompt(prompt)),
            Transition::Superseded => {
                self.sessions.close(owner);
                Ok(Reply::prompt(REPHRASE))
            }
            Transition::AskFallback { session, text } => {
                self.sessions.close(owner);
                self.consult_fallback(
                    owner,
                    &text,
                    &session.original_text,
                    session.title,
                    session.timezone,
                    now,
                )
                .await
            }
        }
    }

    async fn consult_fallback(
        &self,
        owner: OwnerId,
        text: &str,
        original: &str,
        title: String,
        tz: TimezoneSpec,
        now: DateTime<Utc>,
    ) -> Result<Reply> {
        let request = FallbackRequest::new(text, now, tz);
        match resolve_with_retry(&self.fallback, &request, self.retry).await {
            Ok(FallbackReply::Outcome(mut outcome)) => {
                if outcome.title == DEFAULT_TITLE {
                    outcome.title = title;
                }
                if outcome.intent == TemporalIntent::Unresolved {
                    return Ok(Reply::prompt(REPHRASE));
                }
                self.handle_outcome(owner, original, outcome, tz, now).await
            }
            Ok(FallbackReply::Clarify { question, choices }) => {
                let options: Vec<String> = choices.iter().map(|c| c.label.clone()).collect();
                let pending = if choices.is_empty() {
                    Pending::WaitingForAnswer {
                        question: question.clone(),
                    }
                } else {
                    Pending::WaitingForPick {
                        choices,
                        rule: None,
                    }
                };
                self.sessions.put(ClarificationSession {
                    owner_id: owner,
                    original_text: original.to_string(),
                    pending,
                    title,
                    note: None,
                    timezone: tz,
                    created_at: now,
                });
                Ok(Reply::Prompt(Prompt::with_options(question, options)))
            }
            Err(e) => {
                warn!(owner, error = %e, "fallback gave up");
                Ok(Reply::prompt(REPHRASE))
            }
        }
    }

    async fn handle_outcome(
        &self,
        owner: OwnerId,
        original: &str,
        outcome: ParseOutcome,
        tz: TimezoneSpec,
        now: DateTime<Utc>,
    ) -> Result<Reply> {
        if outcome.intent.is_resolved() {
            return self
                .create(owner, &outcome.title, outcome.note, tz, outcome.intent, now)
                .await;
        }
        match ClarificationSession::open(owner, original, &outcome, tz, now) {
            Some(session) => {
                let prompt = session.prompt();
                self.sessions.put(session);
                Ok(Reply::Prompt(prompt))
            }
            None => Ok(Reply::prompt(REPHRASE)),
        }
    }

    /// Persist and arm a reminder for a resolved intent.
    async fn create(
        &self,
        owner: OwnerId,
        title: &str,
        note: Option<String>,
        tz: TimezoneSpec,
        intent: TemporalIntent,
        now: DateTime<Utc>,
    ) -> Result<Reply> {
        let mut reminder = match intent {
            TemporalIntent::Recurring { rule } => {
                if rule.needs_time() {
                    return Ok(Reply::prompt(REPHRASE));
                }
                let next = match next_occurrence(&rule, now) {
                    Ok(next) => next,
                    Err(e) => {
                        warn!(owner, error = %e, "rule has no occurrence");
                        return Ok(Reply::prompt(REPHRASE));
                    }
                };
                Reminder::recurring(owner, title, rule, next, now)
            }
            other => match other.fire_at() {
                Some(at) if at <= now => return Ok(Reply::prompt(TIME_PASSED)),
                Some(at) => Reminder::once(owner, title, tz, at, now),
                None => return Ok(Reply::prompt(REPHRASE)),
            },
        }
        .with_note(note);

        let _guard = self.reminders.lock(&reminder.id).await;
        self.scheduler.schedule(&mut reminder)?;
        if let Err(e) = self.store.save(&reminder) {
            self.scheduler.cancel(&reminder.id);
            return Err(e);
        }
        info!(reminder_id = %reminder.id, owner, next_fire = %reminder.next_fire(), "reminder created");

        let text = match reminder.rule() {
            Some(rule) => format!("📅 Окей, буду напоминать «{}» {}", reminder.title, describe_rule(rule)),
            None => format!(
                "📅 Окей, напомню «{}» {}",
                reminder.title,
                format_local(reminder.next_fire(), &reminder.timezone)
            ),
        };
        Ok(Reply::Confirmation {
            reminder_id: reminder.id,
            text,
        })
    }

    fn resolve_id(&self, owner: OwnerId, key: &str) -> Result<String> {
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::NotFound(key.to_string()));
        }
        let mut hits = self
            .store
            .list_active(owner)?
            .into_iter()
            .filter(|r| r.id.starts_with(key))
            .map(|r| r.id);
        match (hits.next(), hits.next()) {
            (Some(id), None) => Ok(id),
            _ => Err(Error::NotFound(key.to_string())),
        }
    }

    fn load_owned(&self, owner: OwnerId, id: &str) -> Result<Reminder> {
        self.store
            .load(id)?
            .filter(|r| r.owner_id == owner)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::NoFallback;
    use crate::reminder::ReminderStatus;
    use crate::scheduler::JobKind;
    use crate::store::MemoryStore;
    use crate::time::ManualClock;
    use chrono::TimeZone;

    fn msk() -> TimezoneSpec {
        TimezoneSpec::Fixed(180)
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 7, 0, 0).unwrap()
    }

    fn assistant() -> Assistant<MemoryStore, NoFallback> {
        let clock = Arc::new(ManualClock::new(start()));
        let (assistant, _events) =
            Assistant::new(MemoryStore::new(), NoFallback, clock, AssistantConfig::default())
                .unwrap();
        assistant
    }

    fn confirmation_id(reply: &Reply) -> String {
        match reply {
            Reply::Confirmation { reminder_id, .. } => reminder_id.clone(),
            other => panic!("expected confirmation, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn relative_request_is_confirmed_and_armed() {
        let a = assistant();
        let reply = a.on_text(1, "через 30 минут выключить духовку", msk()).await.unwrap();
        assert_eq!(reply.text(), "📅 Окей, напомню «Выключить духовку» 16.10 в 10:30");
        let id = confirmation_id(&reply);
        assert_eq!(
            a.scheduler().job_for(&id, JobKind::Primary),
            Some(start() + Duration::minutes(30))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn past_time_is_refused() {
        let a = assistant();
        let reply = a.on_text(1, "сегодня в 7 утра зарядка", msk()).await.unwrap();
        assert_eq!(reply, Reply::prompt(TIME_PASSED));
        assert!(a.list(1).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_without_model_asks_to_rephrase() {
        let a = assistant();
        let reply = a.on_text(1, "когда-нибудь купить лодку", msk()).await.unwrap();
        assert_eq!(reply, Reply::prompt(REPHRASE));
        assert!(a.sessions.current(1, start()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pick_without_session() {
        let a = assistant();
        assert_eq!(a.on_pick(1, 0).await.unwrap(), Reply::prompt(NOTHING_TO_PICK));
    }

    #[tokio::test(start_paused = true)]
    async fn done_and_delete_drop_jobs() {
        let a = assistant();
        let first = confirmation_id(&a.on_text(1, "через час чай", msk()).await.unwrap());
        let second = confirmation_id(&a.on_text(1, "через 2 часа обед", msk()).await.unwrap());
        assert_eq!(a.scheduler().active_jobs(), 2);

        let done = a.done(1, &first[..8]).await.unwrap();
        assert_eq!(done.status, ReminderStatus::Done);
        assert_eq!(a.scheduler().job_for(&first, JobKind::Primary), None);

        assert!(matches!(a.delete(2, &second).await, Err(Error::NotFound(_))));
        a.delete(1, &second).await.unwrap();
        assert_eq!(a.scheduler().active_jobs(), 0);
        assert!(a.list(1).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn snooze_one_shot_moves_next_fire() {
        let a = assistant();
        let id = confirmation_id(&a.on_text(1, "через час чай", msk()).await.unwrap());
        let reply = a.snooze(1, &id, Duration::minutes(10)).await.unwrap();
        assert_eq!(reply.text(), "⏰ Напомню ещё раз «Чай» 16.10 в 10:10");
        let stored = a.list(1).unwrap();
        assert_eq!(stored[0].next_fire(), start() + Duration::minutes(10));
    }
}
