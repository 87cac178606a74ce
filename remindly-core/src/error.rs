//! Error types for remindly-core.
//!
//! Parse failures are not errors: the parser reports them as
//! `TemporalIntent::Unresolved`. Scheduling conflicts (a second job for the same
//! reminder) are resolved by atomic replacement and stale recurrences by
//! recomputation, so neither has a variant here.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Timezone string that is neither an offset nor a known IANA zone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// Recurrence rule missing the fields its frequency needs.
    #[error("invalid recurrence rule: {0}")]
    InvalidRule(String),

    /// LLM fallback unreachable or returned an unusable payload.
    #[error("fallback failure: {0}")]
    FallbackFailure(String),

    /// Transport could not deliver a notification.
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("reminder not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
