//! In-memory job table: one pending fire job per scheduled reminder.
//!
//! Each job is a tokio task that sleeps until its instant and then sends a
//! [`FireEvent`] down the channel handed out by [`Scheduler::new`]. Replacing
//! or canceling a job aborts the task under the table lock and bumps the
//! generation, so an event already in flight for an old job is recognized as
//! stale by [`Scheduler::accept`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::recurrence::next_occurrence;
use crate::reminder::Reminder;
use crate::time::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// The reminder's own cadence.
    Primary,
    /// One-off extra fire for a snoozed recurring reminder.
    Snooze,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FireEvent {
    pub reminder_id: String,
    pub kind: JobKind,
    pub fire_at: DateTime<Utc>,
    generation: u64,
}

/// Read-only view of a pending job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub reminder_id: String,
    pub kind: JobKind,
    pub fire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerPolicy {
    /// One-shots missed by less than this still fire at their stored instant.
    pub misfire_grace: Duration,
    /// Offset from "now" for one-shots missed by more than the grace window.
    pub catch_up_epsilon: Duration,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            misfire_grace: Duration::seconds(60),
            catch_up_epsilon: Duration::seconds(5),
        }
    }
}

/// Outcome of a startup pass.
#[derive(Debug, Default)]
pub struct Reconciled {
    /// Reminders whose stored state changed and needs saving, failed ones included.
    pub changed: Vec<Reminder>,
    /// Reminders marked failed because their trigger could not be armed.
    pub failed: usize,
}

struct Job {
    fire_at: DateTime<Utc>,
    generation: u64,
    handle: JoinHandle<()>,
}

type JobKey = (String, JobKind);

pub struct Scheduler {
    jobs: Mutex<HashMap<JobKey, Job>>,
    generation: AtomicU64,
    events: mpsc::UnboundedSender<FireEvent>,
    clock: Arc<dyn Clock>,
    policy: SchedulerPolicy,
}

impl Scheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        policy: SchedulerPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<FireEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            jobs: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(1),
            events,
            clock,
            policy,
        };
        (scheduler, rx)
    }

    pub fn policy(&self) -> &SchedulerPolicy {
        &self.policy
    }

    /// Arm the primary job for `reminder`, replacing any existing one.
    ///
    /// Recurring reminders whose stored `next_fire` is not in the future are
    /// recomputed first. Returns the armed instant, or `None` when the reminder
    /// is not `Scheduled` (its jobs are dropped instead).
    pub fn schedule(&self, reminder: &mut Reminder) -> Result<Option<DateTime<Utc>>> {
        if !reminder.is_scheduled() {
            self.cancel(&reminder.id);
            return Ok(None);
        }
        let now = self.clock.now();
        if let Some(rule) = reminder.rule() {
            if reminder.next_fire() <= now {
                let next = next_occurrence(rule, now)?;
                reminder.set_next_fire(next, now);
            }
        }
        let at = reminder.next_fire();
        self.arm(&reminder.id, JobKind::Primary, at);
        Ok(Some(at))
    }

    /// Drop every job of `reminder_id`. Returns whether anything was pending.
    pub fn cancel(&self, reminder_id: &str) -> bool {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for kind in [JobKind::Primary, JobKind::Snooze] {
            if let Some(job) = jobs.remove(&(reminder_id.to_string(), kind)) {
                job.handle.abort();
                removed = true;
            }
        }
        if removed {
            debug!(reminder_id, "jobs canceled");
        }
        removed
    }

    /// Fire again `delta` from now.
    ///
    /// One-shots move their `next_fire`; recurring reminders get a one-off
    /// supplementary job and keep their cadence.
    pub fn snooze(&self, reminder: &mut Reminder, delta: Duration) -> DateTime<Utc> {
        let now = self.clock.now();
        let at = now + delta;
        if reminder.is_recurring() {
            reminder.snoozed_until = Some(at);
            reminder.updated_at = now;
            self.arm(&reminder.id, JobKind::Snooze, at);
        } else {
            reminder.set_next_fire(at, now);
            self.arm(&reminder.id, JobKind::Primary, at);
        }
        at
    }

    /// Claim a fire event. Returns false for events of replaced or canceled
    /// jobs, which must be ignored.
    pub fn accept(&self, event: &FireEvent) -> bool {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (event.reminder_id.clone(), event.kind);
        match jobs.get(&key) {
            Some(job) if job.generation == event.generation => {
                jobs.remove(&key);
                true
            }
            _ => {
                debug!(reminder_id = %event.reminder_id, "stale fire event dropped");
                false
            }
        }
    }

    /// State transition after an accepted fire.
    ///
    /// One-shots record the delivery and stay `Scheduled` until done or
    /// snoozed. Recurring reminders re-arm at the next occurrence after the
    /// later of now and the fired instant. Snooze fires leave the cadence alone.
    pub fn on_fire(
        &self,
        event: &FireEvent,
        reminder: &mut Reminder,
    ) -> Result<Option<DateTime<Utc>>> {
        let now = self.clock.now();
        reminder.mark_fired(now.max(event.fire_at));
        if event.kind == JobKind::Snooze {
            reminder.snoozed_until = None;
            return Ok(None);
        }
        if !reminder.is_scheduled() {
            return Ok(None);
        }
        let Some(rule) = reminder.rule() else {
            return Ok(None);
        };
        let next = next_occurrence(rule, now.max(event.fire_at))?;
        reminder.set_next_fire(next, now);
        self.arm(&reminder.id, JobKind::Primary, next);
        Ok(Some(next))
    }

    /// Re-arm persisted reminders after a restart. A reminder that cannot be
    /// armed is marked failed and the pass goes on.
    pub fn reconcile_on_startup(&self, reminders: Vec<Reminder>) -> Reconciled {
        let now = self.clock.now();
        let mut out = Reconciled::default();
        for mut reminder in reminders {
            let before = reminder.clone();
            match self.reconcile_one(&mut reminder, now) {
                Ok(()) if reminder == before => {}
                Ok(()) => out.changed.push(reminder),
                Err(e) => {
                    warn!(reminder_id = %reminder.id, error = %e, "stored reminder cannot be armed; marked failed");
                    self.cancel(&reminder.id);
                    reminder.mark_failed(now);
                    out.failed += 1;
                    out.changed.push(reminder);
                }
            }
        }
        out
    }

    fn reconcile_one(&self, reminder: &mut Reminder, now: DateTime<Utc>) -> Result<()> {
        if !reminder.is_scheduled() {
            return Ok(());
        }
        let before = reminder.next_fire();
        match reminder.rule() {
            Some(rule) => {
                let next = next_occurrence(rule, now)?;
                if next != before {
                    reminder.set_next_fire(next, now);
                    info!(reminder_id = %reminder.id, stale = %before, next = %next, "recurring reminder caught up");
                }
            }
            None if reminder.awaiting_ack() => return Ok(()),
            None if before < now - self.policy.misfire_grace => {
                let bumped = now + self.policy.catch_up_epsilon;
                reminder.set_next_fire(bumped, now);
                info!(reminder_id = %reminder.id, missed = %before, "missed reminder bumped");
            }
            None => {}
        }
        self.schedule(reminder)?;

        if let Some(snoozed) = reminder.snoozed_until {
            let at = if snoozed < now - self.policy.misfire_grace {
                now + self.policy.catch_up_epsilon
            } else {
                snoozed
            };
            if at != snoozed {
                reminder.snoozed_until = Some(at);
                reminder.updated_at = now;
            }
            self.arm(&reminder.id, JobKind::Snooze, at);
        }
        Ok(())
    }

    pub fn jobs(&self) -> Vec<ScheduledJob> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<ScheduledJob> = jobs
            .iter()
            .map(|((id, kind), job)| ScheduledJob {
                reminder_id: id.clone(),
                kind: *kind,
                fire_at: job.fire_at,
            })
            .collect();
        out.sort_by_key(|j| j.fire_at);
        out
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Instant of the pending job of the given kind, if any.
    pub fn job_for(&self, reminder_id: &str, kind: JobKind) -> Option<DateTime<Utc>> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.get(&(reminder_id.to_string(), kind)).map(|j| j.fire_at)
    }

    fn arm(&self, reminder_id: &str, kind: JobKind, fire_at: DateTime<Utc>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let delay = (fire_at - self.clock.now()).to_std().unwrap_or_default();
        let event = FireEvent {
            reminder_id: reminder_id.to_string(),
            kind,
            fire_at,
            generation,
        };
        let tx = self.events.clone();

        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
        let replaced = jobs.insert(
            (reminder_id.to_string(), kind),
            Job {
                fire_at,
                generation,
                handle,
            },
        );
        if let Some(old) = replaced {
            old.handle.abort();
            debug!(reminder_id, ?kind, "job replaced");
        }
        debug!(reminder_id, ?kind, %fire_at, "job armed");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let jobs = self.jobs.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, job) in jobs.drain() {
            job.handle.abort();
        }
    }
}
