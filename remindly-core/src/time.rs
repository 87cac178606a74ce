//! Time utilities: timezone parsing, wall-clock conversion, calendar helpers.
//!
//! All comparisons and arithmetic happen on `DateTime<Utc>`. Wall-clock fields
//! are derived only for display and for recurrence field extraction.

use std::fmt;
use std::str::FromStr;
use std::sync::{LazyLock, Mutex, PoisonError};

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc,
    Weekday,
};
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// City buttons offered during onboarding, mapped to whole-hour offsets.
pub const CITY_PRESETS: &[(&str, i32)] = &[
    ("Калининград (+2)", 2),
    ("Москва (+3)", 3),
    ("Самара (+4)", 4),
    ("Екатеринбург (+5)", 5),
    ("Омск (+6)", 6),
    ("Новосибирск (+7)", 7),
    ("Иркутск (+8)", 8),
    ("Якутск (+9)", 9),
    ("Хабаровск (+10)", 10),
];

/// A user's timezone: either a fixed offset or a named IANA zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimezoneSpec {
    /// Signed minutes east of UTC.
    Fixed(i32),
    Named(Tz),
}

impl TimezoneSpec {
    pub fn utc() -> Self {
        TimezoneSpec::Fixed(0)
    }

    /// Offset in effect at `instant`. Named zones are re-resolved every call.
    pub fn offset_at(&self, instant: DateTime<Utc>) -> FixedOffset {
        match self {
            TimezoneSpec::Fixed(minutes) => fixed_offset(*minutes),
            TimezoneSpec::Named(tz) => tz.offset_from_utc_datetime(&instant.naive_utc()).fix(),
        }
    }

    /// Wall-clock fields of `instant` in this zone.
    pub fn to_local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.with_timezone(&self.offset_at(instant)).naive_local()
    }

    /// Resolve wall-clock fields in this zone back to an instant.
    ///
    /// A time inside a DST gap is pushed past the gap; a repeated time picks the
    /// earlier of the two instants.
    pub fn from_local(&self, local: NaiveDateTime) -> DateTime<Utc> {
        let resolved = match self {
            TimezoneSpec::Fixed(minutes) => resolve_local(&fixed_offset(*minutes), local),
            TimezoneSpec::Named(tz) => resolve_local(tz, local),
        };
        resolved.unwrap_or_else(|| {
            let guess = Utc.from_utc_datetime(&local);
            guess - Duration::seconds(self.offset_at(guess).local_minus_utc().into())
        })
    }
}

fn fixed_offset(minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(minutes * 60).unwrap_or(Utc.fix())
}

fn resolve_local<Z: TimeZone>(zone: &Z, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    zone.from_local_datetime(&local)
        .earliest()
        .or_else(|| zone.from_local_datetime(&(local + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

impl fmt::Display for TimezoneSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimezoneSpec::Fixed(minutes) => {
                let sign = if *minutes < 0 { '-' } else { '+' };
                let abs = minutes.abs();
                write!(f, "{sign}{:02}:{:02}", abs / 60, abs % 60)
            }
            TimezoneSpec::Named(tz) => f.write_str(tz.name()),
        }
    }
}

impl FromStr for TimezoneSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_timezone(s)
    }
}

impl TryFrom<String> for TimezoneSpec {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        parse_timezone(&value)
    }
}

impl From<TimezoneSpec> for String {
    fn from(value: TimezoneSpec) -> Self {
        value.to_string()
    }
}

static UTC_OFFSET: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^([+-])(\d{1,2})(?::?(\d{2}))?$"));

/// Parse `±H`, `±HH:MM`, `±HHMM`, an IANA `Region/City` name, or a city preset
/// (full label or bare city name).
pub fn parse_timezone(text: &str) -> Result<TimezoneSpec> {
    let t = text.trim();

    if let Some((_, hours)) = CITY_PRESETS
        .iter()
        .find(|(label, _)| *label == t || label.split_once(" (").is_some_and(|(city, _)| city == t))
    {
        return Ok(TimezoneSpec::Fixed(hours * 60));
    }

    if t.starts_with('+') || t.starts_with('-') {
        let re = UTC_OFFSET.as_ref().map_err(Clone::clone)?;
        let caps = re
            .captures(t)
            .ok_or_else(|| Error::InvalidTimezone(t.to_string()))?;
        let hours: i32 = caps[2]
            .parse()
            .map_err(|_| Error::InvalidTimezone(t.to_string()))?;
        let minutes: i32 = match caps.get(3) {
            Some(m) => m
                .as_str()
                .parse()
                .map_err(|_| Error::InvalidTimezone(t.to_string()))?,
            None => 0,
        };
        if hours > 14 || minutes > 59 {
            return Err(Error::InvalidTimezone(t.to_string()));
        }
        let total = hours * 60 + minutes;
        return Ok(TimezoneSpec::Fixed(if &caps[1] == "-" { -total } else { total }));
    }

    if t.contains('/') && !t.contains(char::is_whitespace) {
        return t
            .parse::<Tz>()
            .map(TimezoneSpec::Named)
            .map_err(|_| Error::InvalidTimezone(t.to_string()));
    }

    Err(Error::InvalidTimezone(t.to_string()))
}

/// Format an instant for people: "16.10 в 19:00".
pub fn format_local(instant: DateTime<Utc>, tz: &TimezoneSpec) -> String {
    tz.to_local(instant).format("%d.%m в %H:%M").to_string()
}

/// ISO-8601 with minute precision and the zone's offset: "2026-10-16T19:00+03:00".
pub fn iso_minutes(instant: DateTime<Utc>, tz: &TimezoneSpec) -> String {
    instant
        .with_timezone(&tz.offset_at(instant))
        .format("%Y-%m-%dT%H:%M%:z")
        .to_string()
}

/// Parse an ISO-ish datetime. Strings without an offset are read in `tz`.
pub fn parse_instant(text: &str, tz: &TimezoneSpec) -> Option<DateTime<Utc>> {
    let t = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(t, "%Y-%m-%dT%H:%M%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(t, fmt).ok())
        .map(|ndt| tz.from_local(ndt))
}

/// Number of days in the given month.
pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// Date in the given month with `day` clamped to the month's last day.
pub fn clamped_date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day.clamp(1, days_in_month(year, month)))
}

/// Next date strictly after `from` that falls on `weekday`.
pub fn next_weekday_after(from: NaiveDate, weekday: Weekday) -> NaiveDate {
    let ahead = (7 + weekday.num_days_from_monday() as i64
        - from.weekday().num_days_from_monday() as i64)
        % 7;
    from + Duration::days(if ahead == 0 { 7 } else { ahead })
}

/// Source of "now". Injected so tests can pin time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
