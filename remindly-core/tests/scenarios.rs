//! End-to-end conversations through the assistant facade.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use remindly_core::{
    Assistant, AssistantConfig, Clock, Error, FallbackReply, FallbackRequest, FallbackResolver,
    FireEvent, JobKind, ManualClock, MemoryStore, NoFallback, NotificationAction,
    NotificationPayload, Notifier, Parser, Reminder, ReminderStatus, ReminderStore, Reply,
    Result, TemporalIntent, TimezoneSpec, decode_payload, next_occurrence, RecurrenceRule,
};
use tokio::sync::mpsc::UnboundedReceiver;

fn msk() -> TimezoneSpec {
    TimezoneSpec::Fixed(180)
}

/// Friday 2026-10-16, 10:00 Moscow time.
fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 7, 0, 0).unwrap()
}

fn local(d: u32, h: u32, m: u32) -> DateTime<Utc> {
    msk().from_local(
        NaiveDate::from_ymd_opt(2026, 10, d)
            .unwrap()
            .and_time(NaiveTime::from_hms_opt(h, m, 0).unwrap()),
    )
}

/// Replays canned model replies and records what it was asked.
#[derive(Default)]
struct Scripted {
    replies: Mutex<VecDeque<String>>,
    asked: Mutex<Vec<String>>,
}

impl Scripted {
    fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            asked: Mutex::new(Vec::new()),
        }
    }
}

impl FallbackResolver for Scripted {
    async fn resolve(&self, request: &FallbackRequest) -> Result<FallbackReply> {
        self.asked.lock().unwrap().push(request.text.clone());
        let raw = self.replies.lock().unwrap().pop_front();
        match raw {
            Some(raw) => decode_payload(&raw, &request.timezone),
            None => Err(Error::FallbackFailure("script exhausted".into())),
        }
    }
}

#[derive(Default)]
struct Recorder {
    delivered: Mutex<Vec<NotificationPayload>>,
}

impl Notifier for Recorder {
    async fn deliver(&self, payload: &NotificationPayload) -> Result<()> {
        self.delivered.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

struct Offline;

impl Notifier for Offline {
    async fn deliver(&self, _payload: &NotificationPayload) -> Result<()> {
        Err(Error::Delivery("chat unreachable".into()))
    }
}

struct Harness<F> {
    assistant: Assistant<Arc<MemoryStore>, F>,
    events: UnboundedReceiver<FireEvent>,
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
}

fn harness<F: FallbackResolver>(fallback: F) -> Harness<F> {
    let clock = Arc::new(ManualClock::new(start()));
    let store = Arc::new(MemoryStore::new());
    let (assistant, events) = Assistant::new(
        store.clone(),
        fallback,
        clock.clone(),
        AssistantConfig::default(),
    )
    .unwrap();
    Harness {
        assistant,
        events,
        clock,
        store,
    }
}

fn reminder_id(reply: &Reply) -> String {
    match reply {
        Reply::Confirmation { reminder_id, .. } => reminder_id.clone(),
        other => panic!("expected confirmation, got {other:?}"),
    }
}

fn options(reply: &Reply) -> Vec<String> {
    match reply {
        Reply::Prompt(prompt) => prompt.options.clone(),
        other => panic!("expected prompt, got {other:?}"),
    }
}

#[test]
fn relative_offset_resolves_from_reference() {
    let out = Parser::new().unwrap().parse("через 30 минут", start(), &msk());
    assert!(matches!(out.intent, TemporalIntent::Relative { .. }));
    assert_eq!(out.intent.fire_at(), Some(local(16, 10, 30)));
}

#[test]
fn ambiguous_hour_offers_both_readings_soonest_first() {
    let parser = Parser::new().unwrap();
    for hour in 1..=11 {
        let out = parser.parse(&format!("завтра в {hour}"), start(), &msk());
        assert_eq!(
            out.intent,
            TemporalIntent::Ambiguous {
                candidates: vec![local(17, hour, 0), local(17, hour + 12, 0)],
                rule: None,
            },
            "hour {hour}"
        );
    }
}

#[test]
fn weekly_rule_never_repeats_the_fired_instant() {
    let rule = RecurrenceRule::weekly([Weekday::Sat], msk()).at(NaiveTime::from_hms_opt(19, 0, 0).unwrap());
    let first = next_occurrence(&rule, start()).unwrap();
    assert_eq!(first, local(17, 19, 0));
    let second = next_occurrence(&rule, first).unwrap();
    assert_eq!(second, local(24, 19, 0));
}

#[tokio::test(start_paused = true)]
async fn ambiguous_request_completes_on_pick() {
    let h = harness(NoFallback);
    let reply = h.assistant.on_text(1, "завтра в 7 позвонить маме", msk()).await.unwrap();
    assert_eq!(options(&reply), vec!["17.10 в 07:00", "17.10 в 19:00"]);

    let reply = h.assistant.on_pick(1, 1).await.unwrap();
    assert_eq!(reply.text(), "📅 Окей, напомню «Позвонить маме» 17.10 в 19:00");
    let id = reminder_id(&reply);
    assert_eq!(
        h.assistant.scheduler().job_for(&id, JobKind::Primary),
        Some(local(17, 19, 0))
    );

    // The session is gone once completed.
    assert_eq!(
        h.assistant.on_pick(1, 0).await.unwrap().text(),
        "Сейчас нечего выбирать. Напиши новую заявку."
    );
}

#[tokio::test(start_paused = true)]
async fn day_only_then_hour_reply() {
    let h = harness(NoFallback);
    let reply = h.assistant.on_text(1, "послезавтра", msk()).await.unwrap();
    assert!(reply.text().starts_with("Во сколько напомнить?"));

    let reply = h.assistant.on_text(1, "18", msk()).await.unwrap();
    assert_eq!(reply.text(), "📅 Окей, напомню «Напоминание» 18.10 в 18:00");
    let stored = h.store.load(&reminder_id(&reply)).unwrap().unwrap();
    assert_eq!(stored.next_fire(), local(18, 18, 0));
}

#[tokio::test(start_paused = true)]
async fn ambiguous_reply_to_time_question_asks_to_pick() {
    let h = harness(NoFallback);
    h.assistant.on_text(1, "послезавтра купить хлеб", msk()).await.unwrap();
    let reply = h.assistant.on_text(1, "9", msk()).await.unwrap();
    assert_eq!(options(&reply), vec!["18.10 в 09:00", "18.10 в 21:00"]);
    let reply = h.assistant.on_pick(1, 0).await.unwrap();
    assert_eq!(reply.text(), "📅 Окей, напомню «Купить хлеб» 18.10 в 09:00");
}

#[tokio::test(start_paused = true)]
async fn unrelated_reply_reprompts_and_new_request_supersedes() {
    let h = harness(NoFallback);
    h.assistant.on_text(1, "послезавтра", msk()).await.unwrap();

    let reply = h.assistant.on_text(1, "ммм", msk()).await.unwrap();
    assert!(reply.text().starts_with("Во сколько напомнить?"));

    let reply = h.assistant.on_text(1, "через 10 минут чайник", msk()).await.unwrap();
    assert_eq!(reply.text(), "📅 Окей, напомню «Чайник» 16.10 в 10:10");
    assert_eq!(h.store.list_active(1).unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn sessions_are_per_owner() {
    let h = harness(NoFallback);
    h.assistant.on_text(1, "послезавтра", msk()).await.unwrap();
    h.assistant.on_text(2, "завтра в 7", msk()).await.unwrap();

    let reply = h.assistant.on_text(1, "20:00", msk()).await.unwrap();
    assert_eq!(reply.text(), "📅 Окей, напомню «Напоминание» 18.10 в 20:00");
    let reply = h.assistant.on_pick(2, 0).await.unwrap();
    assert_eq!(reply.text(), "📅 Окей, напомню «Напоминание» 17.10 в 07:00");
}

#[tokio::test(start_paused = true)]
async fn weekly_without_day_asks_for_weekday() {
    let h = harness(NoFallback);
    let reply = h.assistant.on_text(1, "каждую неделю в 10:00 уборка", msk()).await.unwrap();
    assert_eq!(options(&reply).len(), 7);

    // "10:00" still has two readings once Saturday is chosen.
    let reply = h.assistant.on_pick(1, 5).await.unwrap();
    assert_eq!(
        options(&reply),
        vec!["по субботам в 10:00", "по субботам в 22:00"]
    );

    let reply = h.assistant.on_pick(1, 0).await.unwrap();
    assert_eq!(
        reply.text(),
        "📅 Окей, буду напоминать «Уборка» по субботам в 10:00"
    );
    let stored = h.store.load(&reminder_id(&reply)).unwrap().unwrap();
    assert_eq!(stored.next_fire(), local(17, 10, 0));
}

#[tokio::test(start_paused = true)]
async fn clarification_expires() {
    let h = harness(NoFallback);
    h.assistant.on_text(1, "послезавтра", msk()).await.unwrap();
    h.clock.advance(Duration::hours(25));
    let reply = h.assistant.on_pick(1, 0).await.unwrap();
    assert_eq!(reply.text(), "Сейчас нечего выбирать. Напиши новую заявку.");
}

#[tokio::test(start_paused = true)]
async fn model_resolves_what_the_rules_cannot() {
    let h = harness(Scripted::new(&[
        r#"{"intent":"create_reminder","fixed_datetime":"2026-10-20T12:00+03:00"}"#,
    ]));
    let reply = h.assistant.on_text(1, "купить лодку", msk()).await.unwrap();
    assert_eq!(reply.text(), "📅 Окей, напомню «Купить лодку» 20.10 в 12:00");
}

#[tokio::test(start_paused = true)]
async fn model_clarification_round_trip() {
    let h = harness(Scripted::new(&[
        r#"{"intent":"ask_clarification","question":"Когда именно?","variants":[{"label":"Завтра утром","iso_datetime":"2026-10-17T08:00+03:00"},"Другое"]}"#,
        r#"{"intent":"create_reminder","fixed_datetime":"2026-10-21T09:00+03:00"}"#,
    ]));
    let reply = h.assistant.on_text(1, "сходить к врачу", msk()).await.unwrap();
    assert_eq!(reply.text(), "Когда именно?");
    assert_eq!(options(&reply), vec!["Завтра утром", "Другое"]);

    let reply = h.assistant.on_pick(1, 1).await.unwrap();
    assert_eq!(reply.text(), "📅 Окей, напомню «Сходить к врачу» 21.10 в 09:00");

    let asked = h.assistant_fallback_requests();
    assert_eq!(asked.len(), 2);
    assert_eq!(
        asked[1],
        "Исходная заявка: сходить к врачу\nОтвет на уточнение: Другое"
    );
}

#[tokio::test(start_paused = true)]
async fn model_failure_asks_to_rephrase() {
    let h = harness(Scripted::new(&[]));
    let reply = h.assistant.on_text(1, "купить лодку", msk()).await.unwrap();
    assert!(reply.text().starts_with("Не понял, когда напомнить."));
    assert!(h.store.list_active(1).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn weekly_fire_reschedules_even_when_delivery_fails() {
    let mut h = harness(NoFallback);
    let reply = h.assistant.on_text(1, "каждую субботу в 19:00 созвон", msk()).await.unwrap();
    let id = reminder_id(&reply);

    let event = h.events.recv().await.unwrap();
    assert_eq!(event.fire_at, local(17, 19, 0));
    h.clock.set(event.fire_at);

    h.assistant.handle_fire(&event, &Offline).await.unwrap();
    let stored = h.store.load(&id).unwrap().unwrap();
    assert_eq!(stored.next_fire(), local(24, 19, 0));
    assert_eq!(
        h.assistant.scheduler().job_for(&id, JobKind::Primary),
        Some(local(24, 19, 0))
    );

    // The same event again is stale.
    let recorder = Recorder::default();
    h.assistant.handle_fire(&event, &recorder).await.unwrap();
    assert!(recorder.delivered.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn one_shot_fires_once_and_survives_restart_without_refiring() {
    let mut h = harness(NoFallback);
    let reply = h.assistant.on_text(1, "через 30 минут чай", msk()).await.unwrap();
    let id = reminder_id(&reply);

    let event = h.events.recv().await.unwrap();
    h.clock.set(event.fire_at);
    let recorder = Recorder::default();
    h.assistant.handle_fire(&event, &recorder).await.unwrap();

    let delivered = recorder.delivered.lock().unwrap().clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].text(), "🔔 «Чай»");
    assert_eq!(
        delivered[0].actions,
        vec![
            NotificationAction::Snooze { minutes: 10 },
            NotificationAction::Snooze { minutes: 60 },
            NotificationAction::Done,
        ]
    );
    assert_eq!(h.assistant.scheduler().active_jobs(), 0);

    // A fresh process over the same store leaves the delivered one-shot alone.
    let (restarted, _events) = Assistant::new(
        h.store.clone(),
        NoFallback,
        h.clock.clone(),
        AssistantConfig::default(),
    )
    .unwrap();
    assert_eq!(restarted.reconcile_on_startup().await.unwrap(), 0);

    // Snoozing re-arms it.
    restarted.snooze(1, &id, Duration::minutes(10)).await.unwrap();
    assert_eq!(
        restarted.scheduler().job_for(&id, JobKind::Primary),
        Some(h.clock.now() + Duration::minutes(10))
    );
}

#[tokio::test(start_paused = true)]
async fn restart_catches_up_missed_one_shot() {
    let h = harness(NoFallback);
    let missed = Reminder::once(1, "отчёт", msk(), start() - Duration::minutes(5), start() - Duration::hours(1));
    let future = Reminder::once(1, "обед", msk(), start() + Duration::hours(3), start());
    h.store.save(&missed).unwrap();
    h.store.save(&future).unwrap();

    assert_eq!(h.assistant.reconcile_on_startup().await.unwrap(), 2);
    let caught_up = start() + Duration::seconds(5);
    assert_eq!(
        h.assistant.scheduler().job_for(&missed.id, JobKind::Primary),
        Some(caught_up)
    );
    assert_eq!(h.store.load(&missed.id).unwrap().unwrap().next_fire(), caught_up);
    assert_eq!(
        h.assistant.scheduler().job_for(&future.id, JobKind::Primary),
        Some(future.next_fire())
    );
}

#[tokio::test(start_paused = true)]
async fn rescheduling_keeps_one_job_per_reminder() {
    let h = harness(NoFallback);
    let id = reminder_id(&h.assistant.on_text(1, "через час чай", msk()).await.unwrap());
    for minutes in [5, 15, 25] {
        h.assistant.snooze(1, &id, Duration::minutes(minutes)).await.unwrap();
    }
    assert_eq!(h.assistant.scheduler().active_jobs(), 1);
    assert_eq!(
        h.assistant.scheduler().job_for(&id, JobKind::Primary),
        Some(start() + Duration::minutes(25))
    );
}

#[tokio::test(start_paused = true)]
async fn oversized_numbers_get_a_rephrase_not_a_crash() {
    let h = harness(NoFallback);
    for text in [
        "через 999999999999 минут чай",
        "через 999999999999999 дней",
        "каждые 200000000 дней полив",
        "каждые 4000000000 часов проверка",
    ] {
        let reply = h.assistant.on_text(1, text, msk()).await.unwrap();
        assert!(reply.text().starts_with("Не понял, когда напомнить."), "{text}");
    }
    assert!(h.store.list_active(1).unwrap().is_empty());
    assert_eq!(h.assistant.scheduler().active_jobs(), 0);
}

#[tokio::test(start_paused = true)]
async fn restart_skips_a_broken_record() {
    let h = harness(NoFallback);
    let evening = NaiveTime::from_hms_opt(21, 0, 0).unwrap();
    let rule = RecurrenceRule::daily(msk()).at(evening);
    let good = Reminder::recurring(1, "таблетка", rule.clone(), next_occurrence(&rule, start()).unwrap(), start());
    let broken = Reminder::recurring(1, "сломано", RecurrenceRule::daily(msk()), start(), start());
    let once = Reminder::once(1, "обед", msk(), start() + Duration::hours(3), start());
    for r in [&good, &broken, &once] {
        h.store.save(r).unwrap();
    }

    assert_eq!(h.assistant.reconcile_on_startup().await.unwrap(), 2);
    assert_eq!(
        h.store.load(&broken.id).unwrap().unwrap().status,
        ReminderStatus::Failed
    );
    let listed: Vec<String> = h.assistant.list(1).unwrap().into_iter().map(|r| r.id).collect();
    assert_eq!(listed.len(), 2);
    assert!(!listed.contains(&broken.id));
}

#[tokio::test(start_paused = true)]
async fn recurring_reminder_without_next_occurrence_is_marked_failed() {
    let mut h = harness(NoFallback);
    // Day 0 of the month never comes.
    let mut rule = RecurrenceRule::monthly(1, msk()).at(NaiveTime::from_hms_opt(9, 0, 0).unwrap());
    rule.day_of_month = Some(0);
    let mut reminder = Reminder::recurring(1, "аренда", rule, start() + Duration::minutes(1), start());
    h.assistant.scheduler().schedule(&mut reminder).unwrap();
    h.store.save(&reminder).unwrap();

    let event = h.events.recv().await.unwrap();
    h.clock.set(event.fire_at);
    let recorder = Recorder::default();
    h.assistant.handle_fire(&event, &recorder).await.unwrap();

    assert_eq!(recorder.delivered.lock().unwrap().len(), 1);
    let stored = h.store.load(&reminder.id).unwrap().unwrap();
    assert_eq!(stored.status, ReminderStatus::Failed);
    assert_eq!(h.assistant.scheduler().active_jobs(), 0);
    assert!(h.assistant.list(1).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn snoozed_recurring_reminder_keeps_its_snooze_across_restart() {
    let h = harness(NoFallback);
    let id = reminder_id(
        &h.assistant
            .on_text(1, "каждый день в 21:00 таблетка", msk())
            .await
            .unwrap(),
    );
    h.assistant.snooze(1, &id, Duration::minutes(10)).await.unwrap();
    let snoozed = start() + Duration::minutes(10);
    assert_eq!(h.store.load(&id).unwrap().unwrap().snoozed_until, Some(snoozed));

    let (restarted, _events) = Assistant::new(
        h.store.clone(),
        NoFallback,
        h.clock.clone(),
        AssistantConfig::default(),
    )
    .unwrap();
    assert_eq!(restarted.reconcile_on_startup().await.unwrap(), 2);
    assert_eq!(restarted.scheduler().job_for(&id, JobKind::Snooze), Some(snoozed));
    assert_eq!(
        restarted.scheduler().job_for(&id, JobKind::Primary),
        Some(local(16, 21, 0))
    );
}

impl Harness<Scripted> {
    fn assistant_fallback_requests(&self) -> Vec<String> {
        self.assistant.fallback().asked.lock().unwrap().clone()
    }
}
