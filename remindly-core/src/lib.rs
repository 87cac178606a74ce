//! remindly-core: natural-language reminder parsing, clarification and scheduling.

pub mod clarify;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod intent;
pub mod locks;
pub mod parser;
pub mod recurrence;
pub mod reminder;
pub mod scheduler;
pub mod store;
pub mod time;

pub use clarify::{
    ClarificationSession, ClarifyPolicy, Choice, Pending, Prompt, ReplyInput, SessionStore,
    Transition, advance,
};
pub use engine::{Assistant, AssistantConfig, Notifier, Reply};
pub use error::{Error, Result};
pub use fallback::{
    FallbackReply, FallbackRequest, FallbackResolver, NoFallback, RetryPolicy, decode_payload,
    resolve_with_retry,
};
pub use intent::{Meridiem, ParseOutcome, TemporalIntent, TimeTarget};
pub use locks::KeyedLocks;
pub use parser::{ClockTime, HourReading, Parser, read_hour};
pub use recurrence::{Frequency, Interval, IntervalUnit, RecurrenceRule, next_occurrence};
pub use reminder::{
    DEFAULT_TITLE, NotificationAction, NotificationPayload, OwnerId, Reminder, ReminderStatus,
    Trigger,
};
pub use scheduler::{FireEvent, JobKind, Reconciled, ScheduledJob, Scheduler, SchedulerPolicy};
pub use store::{MemoryStore, ReminderStore};
pub use time::{
    CITY_PRESETS, Clock, ManualClock, SystemClock, TimezoneSpec, format_local,
    parse_timezone,
};
