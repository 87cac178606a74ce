//! Deterministic temporal parser for Russian reminder requests.
//!
//! Matchers are pure functions tried in a fixed priority order; the first one
//! that recognizes something wins. Later matchers are more general, so their
//! position in `MATCHERS` is part of the contract:
//!
//! 1. recurrence ("каждый день", "по пятницам", "каждые 15 минут")
//! 2. relative offsets ("через 30 минут", "через полчаса")
//! 3. same time N days ahead ("завтра в это же время")
//! 4. day word or weekday + explicit time ("завтра в 7", "в пятницу в 19:30")
//! 5. day word alone, optionally with a part of day ("завтра вечером")
//! 6. explicit date ("25.12", "3 марта", "15-го") with optional time
//! 7. bare time ("в 7", "19:30", "7 вечера")
//! 8. weekday alone ("в пятницу вечером")
//!
//! No match yields `TemporalIntent::Unresolved`; the LLM fallback is consulted
//! by the caller, never from here.

use std::ops::Range;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use regex::{Captures, Regex};
use tracing::debug;

use crate::error::Result;
use crate::intent::{Meridiem, ParseOutcome, TemporalIntent, TimeTarget, time_of_day};
use crate::recurrence::{Interval, IntervalUnit, RecurrenceRule, next_occurrence};
use crate::reminder::normalize_title;
use crate::time::{TimezoneSpec, next_weekday_after};

const WEEKDAY_WORD: &str =
    r"(понедельник\w*|вторник\w*|сред(?:а|у|ы|е|ам)\b|четверг\w*|пятниц\w*|суббот\w*|воскресень\w*)";
const MONTH_WORD: &str = r"(январ\w*|феврал\w*|март\w*|апрел\w*|ма[йя]\b|июн\w*|июл\w*|август\w*|сентябр\w*|октябр\w*|ноябр\w*|декабр\w*)";

/// Hour, minute and optional part-of-day as written by the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockTime {
    pub hour: u32,
    pub minute: u32,
    pub meridiem: Option<Meridiem>,
    span: Range<usize>,
}

impl ClockTime {
    pub fn new(hour: u32, minute: u32, meridiem: Option<Meridiem>) -> Self {
        Self {
            hour,
            minute,
            meridiem,
            span: 0..0,
        }
    }
}

/// How an hour reads once the meridiem rule is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HourReading {
    Exact(u32),
    /// `[1,12]` without a marker: `h` or `(h + 12) mod 24`.
    Either(u32, u32),
}

/// The hour-ambiguity rule. `h` in `[13,23]` or `0` is always exact; `[1,12]`
/// is exact only with a part-of-day marker.
pub fn read_hour(hour: u32, meridiem: Option<Meridiem>) -> HourReading {
    match meridiem {
        Some(m) => HourReading::Exact(m.apply(hour)),
        None if hour == 0 || (13..=23).contains(&hour) => HourReading::Exact(hour),
        None => HourReading::Either(hour, (hour + 12) % 24),
    }
}

struct Ctx<'a> {
    text: &'a str,
    now: DateTime<Utc>,
    today: NaiveDate,
    tz: TimezoneSpec,
}

struct Hit {
    intent: TemporalIntent,
    spans: Vec<Range<usize>>,
}

type Matcher = fn(&Parser, &Ctx<'_>) -> Option<Hit>;

const MATCHERS: [(&str, Matcher); 8] = [
    ("recurrence", Parser::match_recurrence),
    ("relative", Parser::match_relative),
    ("same_time", Parser::match_same_time),
    ("day_and_time", Parser::match_day_and_time),
    ("day_only", Parser::match_day_only),
    ("explicit_date", Parser::match_explicit_date),
    ("bare_time", Parser::match_bare_time),
    ("weekday_only", Parser::match_weekday_only),
];

/// Matchers whose hit counts as a fresh request while a clarification is open.
const FRESH_REQUEST_MATCHERS: usize = 7;

pub struct Parser {
    interval: Regex,
    daily: Regex,
    daily_part: Regex,
    every_weekday: Regex,
    by_weekdays: Regex,
    workdays: Regex,
    weekends: Regex,
    weekly: Regex,
    monthly: Regex,
    monthly_day: Regex,
    yearly: Regex,
    relative: Regex,
    same_time: Regex,
    day_word: Regex,
    weekday: Regex,
    meridiem: Regex,
    clock: Regex,
    reply_time: Regex,
    numeric_date: Regex,
    named_date: Regex,
    day_of_month: Regex,
    filler: Regex,
    lead_about: Regex,
}

impl Parser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            interval: Regex::new(
                r"\bкажд(?:ые|ый|ую|ое)\s+(?:(?P<n>\d+)\s+)?(?P<unit>полчаса|секунд\w*|сек\b|минут\w*|мин\b|час(?:а|ов)?\b|дн(?:я|ей)\b|сутки)",
            )?,
            daily: Regex::new(r"\b(?:кажд(?:ый|ое)\s+день|ежедневно)\b")?,
            daily_part: Regex::new(r"\bкажд(?:ое|ый|ую)\s+(утро|вечер|ночь)\b")?,
            every_weekday: Regex::new(&format!(r"\bкажд(?:ый|ую|ое)\s+{WEEKDAY_WORD}"))?,
            by_weekdays: Regex::new(
                r"\bпо\s+(понедельникам|вторникам|средам|четвергам|пятницам|субботам|воскресеньям)\b",
            )?,
            workdays: Regex::new(r"\b(?:по\s+будням|в\s+будни)\b")?,
            weekends: Regex::new(r"\b(?:по\s+выходным|в\s+выходные)\b")?,
            weekly: Regex::new(r"\b(?:кажд(?:ую|ой)\s+недел\w*|еженедельно)")?,
            monthly: Regex::new(r"\b(?:кажд\w*\s+месяц\w*|ежемесячно)")?,
            monthly_day: Regex::new(
                r"\b(?P<every>кажд(?:ое|ый)\s+)?(?P<d>\d{1,2})(?:-?(?:е|го|ое))?\s+числ(?:о|а)\b",
            )?,
            yearly: Regex::new(r"\b(?:кажд\w*\s+год\w*|ежегодно)")?,
            relative: Regex::new(
                r"\bчерез\s+(?:(?P<half>полчаса)|(?P<onehalf>полтора\s+час\w*)|(?:(?P<n>\d+|пару)\s+)?(?P<unit>секунд\w*|сек\b|минут\w*|мин\b|час\w*|день|дн(?:я|ей)\b|недел\w*))",
            )?,
            same_time: Regex::new(r"\b(?:в\s+)?(?:это|то)\s+же\s+время\b")?,
            day_word: Regex::new(r"\b(послезавтра|завтра|сегодня)\b")?,
            weekday: Regex::new(&format!(r"(?:\b(?:в|во)\s+)?\b{WEEKDAY_WORD}"))?,
            meridiem: Regex::new(r"\b(утром|днем|вечером|ночью)\b")?,
            clock: Regex::new(
                r"(?:^|[^\w:.])(?P<pre>(?:в|к)\s+)?(?P<h>\d{1,2})(?:(?P<sep>[:.])(?P<m>\d{2}))?\b(?:\s*час(?:а|ов)?\b)?(?:\s+(?P<mer>утра|дня|вечера|ночи)\b)?",
            )?,
            reply_time: Regex::new(
                r"^\s*(?P<mer1>утром|днем|вечером|ночью)?\s*(?:(?:в|к)\s+)?(?P<h>\d{1,2})(?:[:.](?P<m>\d{2}))?\s*(?:час(?:а|ов)?)?\s*(?P<mer2>утра|дня|вечера|ночи|утром|днем|вечером|ночью)?[\s.!]*$",
            )?,
            numeric_date: Regex::new(r"\b(\d{1,2})\.(\d{1,2})(?:\.(\d{4}|\d{2}))?\b")?,
            named_date: Regex::new(&format!(r"\b(\d{{1,2}})\s+{MONTH_WORD}"))?,
            day_of_month: Regex::new(r"\b(\d{1,2})(?:-?(?:го|е)\b(?:\s+числа\b)?|\s+числа\b)")?,
            filler: Regex::new(
                r"\b(?:пожалуйста|плиз|напомни(?:ть)?(?:\s+мне)?|напоминание|поставь|создай)\b",
            )?,
            lead_about: Regex::new(r"^\s*(?:о|об|обо|про|что|чтобы)\s+")?,
        })
    }

    /// Map free text to a temporal intent plus a candidate title.
    pub fn parse(&self, text: &str, now: DateTime<Utc>, tz: &TimezoneSpec) -> ParseOutcome {
        let normalized = normalize(text);
        let ctx = Ctx {
            text: &normalized,
            now,
            today: tz.to_local(now).date(),
            tz: *tz,
        };

        for (name, matcher) in MATCHERS {
            if let Some(hit) = matcher(self, &ctx) {
                debug!(matcher = name, "temporal pattern matched");
                return ParseOutcome {
                    intent: hit.intent,
                    title: self.extract_title(text, &normalized, &hit.spans),
                    note: None,
                };
            }
        }

        ParseOutcome::unresolved(self.extract_title(text, &normalized, &[]))
    }

    /// True when `text` hits one of the specific request patterns (1-7).
    pub fn looks_like_request(&self, text: &str, now: DateTime<Utc>, tz: &TimezoneSpec) -> bool {
        let normalized = normalize(text);
        let ctx = Ctx {
            text: &normalized,
            now,
            today: tz.to_local(now).date(),
            tz: *tz,
        };
        MATCHERS[..FRESH_REQUEST_MATCHERS]
            .iter()
            .any(|(_, matcher)| matcher(self, &ctx).is_some())
    }

    /// A clarification answer that is only a time: "18", "в 7", "19:30", "7 вечера".
    pub fn parse_reply_time(&self, text: &str) -> Option<ClockTime> {
        let normalized = normalize(text);
        let caps = self.reply_time.captures(&normalized)?;
        let hour: u32 = caps.name("h")?.as_str().parse().ok()?;
        let minute: u32 = match caps.name("m") {
            Some(m) => m.as_str().parse().ok()?,
            None => 0,
        };
        if hour > 23 || minute > 59 {
            return None;
        }
        let meridiem = caps
            .name("mer2")
            .or_else(|| caps.name("mer1"))
            .and_then(|m| meridiem_word(m.as_str()));
        Some(ClockTime::new(hour, minute, meridiem))
    }

    /// Weekdays named in a clarification answer ("пятница", "по будням").
    pub fn parse_reply_weekdays(&self, text: &str) -> Vec<Weekday> {
        let normalized = normalize(text);
        let mut days = self.weekdays_in(&normalized).0;
        if self.workdays.is_match(&normalized) || normalized.contains("будни") {
            days.extend([Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri]);
        }
        if self.weekends.is_match(&normalized) || normalized.contains("выходн") {
            days.extend([Weekday::Sat, Weekday::Sun]);
        }
        days.sort_by_key(|d| d.num_days_from_monday());
        days.dedup();
        days
    }

    /// Complete a time-less intent with a clock time.
    pub fn complete_time(
        &self,
        target: &TimeTarget,
        meridiem: Option<Meridiem>,
        clock: &ClockTime,
        now: DateTime<Utc>,
        tz: &TimezoneSpec,
    ) -> TemporalIntent {
        let clock = ClockTime {
            meridiem: clock.meridiem.or(meridiem),
            ..clock.clone()
        };
        match target {
            TimeTarget::Date { date } => resolve_on_date(*date, &clock, now, tz, false),
            TimeTarget::Rule { rule } => rule_at_clock(rule.clone(), &clock, now),
        }
    }

    // --- matchers -------------------------------------------------------

    fn match_recurrence(&self, ctx: &Ctx<'_>) -> Option<Hit> {
        if let Some(caps) = self.interval.captures(ctx.text) {
            return self.interval_rule(ctx, &caps);
        }

        if let Some(m) = self.daily.find(ctx.text) {
            let rule = RecurrenceRule::daily(ctx.tz);
            return Some(self.finish_rule(ctx, rule, vec![m.range()], None));
        }

        if let Some(caps) = self.daily_part.captures(ctx.text) {
            let whole = caps.get(0)?;
            let meridiem = match &caps[1] {
                "утро" => Meridiem::Morning,
                "вечер" => Meridiem::Evening,
                _ => Meridiem::Night,
            };
            let rule = RecurrenceRule::daily(ctx.tz);
            return Some(self.finish_rule(ctx, rule, vec![whole.range()], Some(meridiem)));
        }

        let mut spans = Vec::new();
        let mut days = Vec::new();
        let mut weekly = false;
        if let Some(m) = self.every_weekday.find(ctx.text) {
            weekly = true;
            spans.push(m.range());
        }
        for m in self.by_weekdays.find_iter(ctx.text) {
            weekly = true;
            spans.push(m.range());
        }
        if let Some(m) = self.workdays.find(ctx.text) {
            weekly = true;
            spans.push(m.range());
            days.extend([Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri]);
        }
        if let Some(m) = self.weekends.find(ctx.text) {
            weekly = true;
            spans.push(m.range());
            days.extend([Weekday::Sat, Weekday::Sun]);
        }
        let every_week = self.weekly.find(ctx.text);
        if let Some(m) = &every_week {
            weekly = true;
            spans.push(m.range());
        }
        if weekly {
            let (named, named_spans) = self.weekdays_in(ctx.text);
            days.extend(named);
            spans.extend(named_spans);
            if days.is_empty() {
                return Some(self.weekly_without_day(ctx, spans));
            }
            let rule = RecurrenceRule::weekly(days, ctx.tz);
            return Some(self.finish_rule(ctx, rule, spans, None));
        }

        let monthly_day = self.monthly_day.captures(ctx.text);
        let monthly = self.monthly.find(ctx.text);
        let every_nth = monthly_day
            .as_ref()
            .is_some_and(|caps| caps.name("every").is_some());
        if monthly.is_some() || every_nth {
            let mut spans: Vec<Range<usize>> = monthly.iter().map(|m| m.range()).collect();
            let mut day = None;
            if let Some(caps) = &monthly_day {
                spans.push(caps.get(0)?.range());
                day = caps["d"].parse::<u32>().ok();
            } else if let Some(caps) = self.day_of_month.captures(ctx.text) {
                spans.push(caps.get(0)?.range());
                day = caps[1].parse::<u32>().ok();
            }
            let day = day.filter(|d| (1..=31).contains(d)).unwrap_or(ctx.today.day());
            let rule = RecurrenceRule::monthly(day, ctx.tz);
            return Some(self.finish_rule(ctx, rule, spans, None));
        }

        if let Some(m) = self.yearly.find(ctx.text) {
            let mut spans = vec![m.range()];
            let (month, day) = match self.date_in(ctx.text, &spans) {
                Some((month, day, span)) => {
                    spans.push(span);
                    (month, day)
                }
                None => (ctx.today.month(), ctx.today.day()),
            };
            let rule = RecurrenceRule::yearly(month, day, ctx.tz);
            return Some(self.finish_rule(ctx, rule, spans, None));
        }

        None
    }

    fn match_relative(&self, ctx: &Ctx<'_>) -> Option<Hit> {
        let caps = self.relative.captures(ctx.text)?;
        let whole = caps.get(0)?.range();

        let delta = if caps.name("half").is_some() {
            Duration::minutes(30)
        } else if caps.name("onehalf").is_some() {
            Duration::minutes(90)
        } else {
            let n: i64 = match caps.name("n").map(|m| m.as_str()) {
                None => 1,
                Some("пару") => 2,
                Some(digits) => digits.parse().ok()?,
            };
            let unit = caps.name("unit")?.as_str();
            if unit.starts_with("сек") {
                Duration::try_seconds(n)?
            } else if unit.starts_with("мин") {
                Duration::try_minutes(n)?
            } else if unit.starts_with("час") {
                Duration::try_hours(n)?
            } else if unit.starts_with("недел") {
                Duration::try_weeks(n)?
            } else {
                Duration::try_days(n)?
            }
        };
        ctx.now.checked_add_signed(delta)?;

        // "через 2 дня в 10": a day offset with a time names a date, not a delta.
        let whole_days = delta.num_seconds() % 86_400 == 0;
        if whole_days {
            if let Some(clock) = self.find_clock(ctx.text, std::slice::from_ref(&whole)) {
                let date = ctx.today.checked_add_signed(delta)?;
                let spans = vec![whole, clock.span.clone()];
                let adverb = self.adverb_meridiem(ctx.text);
                let clock = ClockTime {
                    meridiem: clock.meridiem.or(adverb.as_ref().map(|(m, _)| *m)),
                    ..clock
                };
                return Some(Hit {
                    intent: resolve_on_date(date, &clock, ctx.now, &ctx.tz, false),
                    spans: with_adverb(spans, adverb),
                });
            }
        }

        Some(Hit {
            intent: TemporalIntent::Relative {
                reference: ctx.now,
                delta,
            },
            spans: vec![whole],
        })
    }

    fn match_same_time(&self, ctx: &Ctx<'_>) -> Option<Hit> {
        let same = self.same_time.find(ctx.text)?;
        let day = self.day_word.captures(ctx.text)?;
        let offset = day_offset(&day[1]);
        if offset == 0 {
            return None;
        }
        Some(Hit {
            intent: TemporalIntent::Relative {
                reference: ctx.now,
                delta: Duration::days(offset),
            },
            spans: vec![same.range(), day.get(0)?.range()],
        })
    }

    fn match_day_and_time(&self, ctx: &Ctx<'_>) -> Option<Hit> {
        let (date, day_span) = self.base_day(ctx)?;
        let clock = self.find_clock(ctx.text, std::slice::from_ref(&day_span))?;
        let adverb = self.adverb_meridiem(ctx.text);
        let spans = with_adverb(vec![day_span, clock.span.clone()], adverb.clone());
        let clock = ClockTime {
            meridiem: clock.meridiem.or(adverb.map(|(m, _)| m)),
            ..clock
        };
        Some(Hit {
            intent: resolve_on_date(date, &clock, ctx.now, &ctx.tz, false),
            spans,
        })
    }

    fn match_day_only(&self, ctx: &Ctx<'_>) -> Option<Hit> {
        let caps = self.day_word.captures(ctx.text)?;
        let date = ctx.today + Duration::days(day_offset(&caps[1]));
        let adverb = self.adverb_meridiem(ctx.text);
        Some(Hit {
            intent: TemporalIntent::NeedsTime {
                target: TimeTarget::Date { date },
                meridiem: adverb.as_ref().map(|(m, _)| *m),
            },
            spans: with_adverb(vec![caps.get(0)?.range()], adverb),
        })
    }

    fn match_explicit_date(&self, ctx: &Ctx<'_>) -> Option<Hit> {
        let (date, date_span) = self.explicit_date(ctx)?;
        let adverb = self.adverb_meridiem(ctx.text);
        let meridiem = adverb.as_ref().map(|(m, _)| *m);
        match self.find_clock(ctx.text, std::slice::from_ref(&date_span)) {
            Some(clock) => {
                let spans = with_adverb(vec![date_span, clock.span.clone()], adverb);
                let clock = ClockTime {
                    meridiem: clock.meridiem.or(meridiem),
                    ..clock
                };
                Some(Hit {
                    intent: resolve_on_date(date, &clock, ctx.now, &ctx.tz, false),
                    spans,
                })
            }
            None => Some(Hit {
                intent: TemporalIntent::NeedsTime {
                    target: TimeTarget::Date { date },
                    meridiem,
                },
                spans: with_adverb(vec![date_span], adverb),
            }),
        }
    }

    fn match_bare_time(&self, ctx: &Ctx<'_>) -> Option<Hit> {
        let clock = self.find_clock(ctx.text, &[])?;
        let adverb = self.adverb_meridiem(ctx.text);
        let spans = with_adverb(vec![clock.span.clone()], adverb.clone());
        let clock = ClockTime {
            meridiem: clock.meridiem.or(adverb.map(|(m, _)| m)),
            ..clock
        };
        Some(Hit {
            intent: resolve_on_date(ctx.today, &clock, ctx.now, &ctx.tz, true),
            spans,
        })
    }

    fn match_weekday_only(&self, ctx: &Ctx<'_>) -> Option<Hit> {
        let caps = self.weekday.captures(ctx.text)?;
        let weekday = weekday_word(&caps[1])?;
        let date = next_weekday_after(ctx.today, weekday);
        let adverb = self.adverb_meridiem(ctx.text);
        Some(Hit {
            intent: TemporalIntent::NeedsTime {
                target: TimeTarget::Date { date },
                meridiem: adverb.as_ref().map(|(m, _)| *m),
            },
            spans: with_adverb(vec![caps.get(0)?.range()], adverb),
        })
    }

    // --- helpers --------------------------------------------------------

    fn interval_rule(&self, ctx: &Ctx<'_>, caps: &Captures<'_>) -> Option<Hit> {
        let whole = caps.get(0)?.range();
        let n: u32 = match caps.name("n") {
            Some(m) => m.as_str().parse().ok()?,
            None => 1,
        };
        if n == 0 {
            return None;
        }
        let unit = caps.name("unit")?.as_str();
        let interval = if unit == "полчаса" {
            Interval { unit: IntervalUnit::Minute, every: n.checked_mul(30)? }
        } else if unit.starts_with("сек") {
            Interval { unit: IntervalUnit::Second, every: n }
        } else if unit.starts_with("мин") {
            Interval { unit: IntervalUnit::Minute, every: n }
        } else if unit.starts_with("час") {
            Interval { unit: IntervalUnit::Hour, every: n }
        } else {
            Interval { unit: IntervalUnit::Hour, every: n.checked_mul(24)? }
        };

        let mut spans = vec![whole.clone()];
        let mut anchor = ctx.now;
        if interval.unit == IntervalUnit::Hour && interval.every % 24 == 0 {
            if let Some(clock) = self.find_clock(ctx.text, &[whole]) {
                spans.push(clock.span.clone());
                let hour = match read_hour(clock.hour, clock.meridiem) {
                    HourReading::Exact(h) | HourReading::Either(h, _) => h,
                };
                if let Some(at) = local_instant(&ctx.tz, ctx.today, hour, clock.minute) {
                    anchor = if at <= ctx.now {
                        local_instant(&ctx.tz, ctx.today + Duration::days(1), hour, clock.minute)
                            .unwrap_or(at)
                    } else {
                        at
                    };
                }
            }
        }

        let rule = RecurrenceRule::every(interval, anchor, ctx.tz);
        // A step too large to ever fire is not a cadence.
        next_occurrence(&rule, anchor).ok()?;
        Some(Hit {
            intent: TemporalIntent::Recurring { rule },
            spans,
        })
    }

    /// Attach the time of day to a wall-clock rule, or ask for it.
    fn finish_rule(
        &self,
        ctx: &Ctx<'_>,
        rule: RecurrenceRule,
        spans: Vec<Range<usize>>,
        implied: Option<Meridiem>,
    ) -> Hit {
        let adverb = self.adverb_meridiem(ctx.text);
        let meridiem = implied.or(adverb.as_ref().map(|(m, _)| *m));
        match self.find_clock(ctx.text, &spans) {
            Some(clock) => {
                let mut spans = with_adverb(spans, adverb);
                spans.push(clock.span.clone());
                let clock = ClockTime {
                    meridiem: clock.meridiem.or(meridiem),
                    ..clock
                };
                Hit {
                    intent: rule_at_clock(rule, &clock, ctx.now),
                    spans,
                }
            }
            None => Hit {
                intent: TemporalIntent::NeedsTime {
                    target: TimeTarget::Rule { rule },
                    meridiem,
                },
                spans: with_adverb(spans, adverb),
            },
        }
    }

    fn weekly_without_day(&self, ctx: &Ctx<'_>, spans: Vec<Range<usize>>) -> Hit {
        let adverb = self.adverb_meridiem(ctx.text);
        let meridiem = adverb.as_ref().map(|(m, _)| *m);
        let mut rule = RecurrenceRule::weekly([], ctx.tz);
        let mut spoken = None;
        let mut spans = with_adverb(spans, adverb);
        if let Some(clock) = self.find_clock(ctx.text, &spans) {
            spans.push(clock.span.clone());
            match read_hour(clock.hour, clock.meridiem.or(meridiem)) {
                HourReading::Exact(h) => {
                    if let Some(t) = time_of_day(h, clock.minute) {
                        rule = rule.at(t);
                    }
                }
                HourReading::Either(..) => spoken = time_of_day(clock.hour, clock.minute),
            }
        }
        Hit {
            intent: TemporalIntent::NeedsWeekday {
                rule,
                meridiem,
                spoken,
            },
            spans,
        }
    }

    /// Day word or "в <weekday>" that fixes the base date.
    fn base_day(&self, ctx: &Ctx<'_>) -> Option<(NaiveDate, Range<usize>)> {
        if let Some(caps) = self.day_word.captures(ctx.text) {
            let date = ctx.today + Duration::days(day_offset(&caps[1]));
            return Some((date, caps.get(0)?.range()));
        }
        let caps = self.weekday.captures(ctx.text)?;
        let weekday = weekday_word(&caps[1])?;
        Some((next_weekday_after(ctx.today, weekday), caps.get(0)?.range()))
    }

    /// "25.12", "25.12.2026", "3 марта", "15-го (числа)", resolved to the next
    /// such date that is not before today.
    fn explicit_date(&self, ctx: &Ctx<'_>) -> Option<(NaiveDate, Range<usize>)> {
        let numeric = self
            .numeric_date
            .captures_iter(ctx.text)
            .find(|caps| !dotted_clock(ctx.text, caps));
        if let Some(caps) = numeric {
            let day: u32 = caps[1].parse().ok()?;
            let month: u32 = caps[2].parse().ok()?;
            let span = caps.get(0)?.range();
            if let Some(year) = caps.get(3) {
                let mut year: i32 = year.as_str().parse().ok()?;
                if year < 100 {
                    year += 2000;
                }
                return Some((NaiveDate::from_ymd_opt(year, month, day)?, span));
            }
            return Some((upcoming_day_month(ctx.today, month, day)?, span));
        }

        if let Some(caps) = self.named_date.captures(ctx.text) {
            let day: u32 = caps[1].parse().ok()?;
            let month = month_word(&caps[2])?;
            return Some((upcoming_day_month(ctx.today, month, day)?, caps.get(0)?.range()));
        }

        let caps = self.day_of_month.captures(ctx.text)?;
        let day: u32 = caps[1].parse().ok()?;
        if !(1..=31).contains(&day) {
            return None;
        }
        let date = (0..=12).find_map(|k| {
            let (y, m) = month_after(ctx.today.year(), ctx.today.month(), k);
            NaiveDate::from_ymd_opt(y, m, day).filter(|d| *d >= ctx.today)
        })?;
        Some((date, caps.get(0)?.range()))
    }

    /// Month and day from "25.12" or "3 марта", skipping excluded spans.
    fn date_in(&self, text: &str, exclude: &[Range<usize>]) -> Option<(u32, u32, Range<usize>)> {
        for caps in self.numeric_date.captures_iter(text) {
            let span = caps.get(0)?.range();
            if overlaps(&span, exclude) || dotted_clock(text, &caps) {
                continue;
            }
            let day: u32 = caps[1].parse().ok()?;
            let month: u32 = caps[2].parse().ok()?;
            if (1..=12).contains(&month) && (1..=31).contains(&day) {
                return Some((month, day, span));
            }
        }
        let caps = self.named_date.captures(text)?;
        let day: u32 = caps[1].parse().ok()?;
        let month = month_word(&caps[2])?;
        (1..=31)
            .contains(&day)
            .then(|| (month, day, caps.get(0).map(|m| m.range()).unwrap_or(0..0)))
    }

    fn weekdays_in(&self, text: &str) -> (Vec<Weekday>, Vec<Range<usize>>) {
        let mut days = Vec::new();
        let mut spans = Vec::new();
        for caps in self.weekday.captures_iter(text) {
            if let (Some(day), Some(whole)) = (weekday_word(&caps[1]), caps.get(0)) {
                days.push(day);
                spans.push(whole.range());
            }
        }
        (days, spans)
    }

    fn adverb_meridiem(&self, text: &str) -> Option<(Meridiem, Range<usize>)> {
        let caps = self.meridiem.captures(text)?;
        Some((meridiem_word(&caps[1])?, caps.get(0)?.range()))
    }

    /// First token that reads as a clock time: needs "в"/"к", ":MM", or a
    /// part-of-day word, so stray numbers in the title are left alone.
    /// "HH.MM" counts only after "в"/"к".
    fn find_clock(&self, text: &str, exclude: &[Range<usize>]) -> Option<ClockTime> {
        for caps in self.clock.captures_iter(text) {
            let Some(h) = caps.name("h") else { continue };
            let start = caps.name("pre").map(|p| p.start()).unwrap_or(h.start());
            let Some(whole) = caps.get(0) else { continue };
            let span = start..whole.end();
            if overlaps(&span, exclude) {
                continue;
            }

            let digits_end = caps.name("m").map(|m| m.end()).unwrap_or(h.end());
            let rest = &text[digits_end..];
            if rest.starts_with('-')
                || (rest.starts_with('.') && rest[1..].starts_with(|c: char| c.is_ascii_digit()))
            {
                continue;
            }

            // "19.30" is a clock time only right after "в"/"к".
            if caps.name("sep").is_some_and(|m| m.as_str() == ".") && caps.name("pre").is_none() {
                continue;
            }

            let meridiem = caps.name("mer").and_then(|m| meridiem_word(m.as_str()));
            if caps.name("pre").is_none() && caps.name("m").is_none() && meridiem.is_none() {
                continue;
            }

            let Ok(hour) = h.as_str().parse::<u32>() else { continue };
            let minute = match caps.name("m") {
                Some(m) => match m.as_str().parse::<u32>() {
                    Ok(v) => v,
                    Err(_) => continue,
                },
                None => 0,
            };
            if hour > 23 || minute > 59 {
                continue;
            }
            return Some(ClockTime {
                hour,
                minute,
                meridiem,
                span,
            });
        }
        None
    }

    /// Remove matched fragments and filler words from the original text.
    fn extract_title(&self, original: &str, normalized: &str, spans: &[Range<usize>]) -> String {
        let mut cut: Vec<Range<usize>> = spans.to_vec();
        cut.extend(self.filler.find_iter(normalized).map(|m| m.range()));

        let kept: String = original
            .char_indices()
            .filter(|(i, _)| !cut.iter().any(|r| r.contains(i)))
            .map(|(_, c)| c)
            .collect();
        let collapsed = kept.split_whitespace().collect::<Vec<_>>().join(" ");
        let collapsed =
            collapsed.trim_start_matches(|c: char| c.is_whitespace() || ",.;:!-".contains(c));
        let lowered = normalize(collapsed);
        let title = match self.lead_about.find(&lowered) {
            Some(m) => &collapsed[m.end()..],
            None => collapsed,
        };
        normalize_title(title)
    }
}

/// Lowercase and fold "ё" to "е" without changing byte offsets.
fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| {
            let c = if c == 'ё' || c == 'Ё' { 'е' } else { c };
            let mut lower = c.to_lowercase();
            match (lower.next(), lower.next()) {
                (Some(l), None) if l.len_utf8() == c.len_utf8() => l,
                _ => c,
            }
        })
        .collect()
}

fn overlaps(span: &Range<usize>, others: &[Range<usize>]) -> bool {
    others
        .iter()
        .any(|o| span.start < o.end && o.start < span.end)
}

fn with_adverb(
    mut spans: Vec<Range<usize>>,
    adverb: Option<(Meridiem, Range<usize>)>,
) -> Vec<Range<usize>> {
    if let Some((_, span)) = adverb {
        spans.push(span);
    }
    spans
}

fn day_offset(word: &str) -> i64 {
    match word {
        "послезавтра" => 2,
        "завтра" => 1,
        _ => 0,
    }
}

fn weekday_word(word: &str) -> Option<Weekday> {
    const STEMS: [(&str, Weekday); 7] = [
        ("понедельник", Weekday::Mon),
        ("вторник", Weekday::Tue),
        ("сред", Weekday::Wed),
        ("четверг", Weekday::Thu),
        ("пятниц", Weekday::Fri),
        ("суббот", Weekday::Sat),
        ("воскресень", Weekday::Sun),
    ];
    STEMS
        .iter()
        .find(|(stem, _)| word.starts_with(stem))
        .map(|(_, day)| *day)
}

fn month_word(word: &str) -> Option<u32> {
    // "март" must be checked before "ма" (май/мая).
    const STEMS: [(&str, u32); 12] = [
        ("январ", 1),
        ("феврал", 2),
        ("март", 3),
        ("апрел", 4),
        ("ма", 5),
        ("июн", 6),
        ("июл", 7),
        ("август", 8),
        ("сентябр", 9),
        ("октябр", 10),
        ("ноябр", 11),
        ("декабр", 12),
    ];
    STEMS
        .iter()
        .find(|(stem, _)| word.starts_with(stem))
        .map(|(_, month)| *month)
}

fn meridiem_word(word: &str) -> Option<Meridiem> {
    match word {
        "утра" | "утром" => Some(Meridiem::Morning),
        "дня" | "днем" => Some(Meridiem::Day),
        "вечера" | "вечером" => Some(Meridiem::Evening),
        "ночи" | "ночью" => Some(Meridiem::Night),
        _ => None,
    }
}

fn month_after(year: i32, month: u32, k: u32) -> (i32, u32) {
    let zero_based = month - 1 + k;
    (year + (zero_based / 12) as i32, zero_based % 12 + 1)
}

/// The first `day.month` on or after `today`. A 29.02 waits for a leap year.
fn upcoming_day_month(today: NaiveDate, month: u32, day: u32) -> Option<NaiveDate> {
    (0..=8).find_map(|k| {
        NaiveDate::from_ymd_opt(today.year() + k, month, day).filter(|d| *d >= today)
    })
}

/// "в 19.30": a dotted pair right after "в"/"к" that reads as HH.MM.
fn dotted_clock(text: &str, caps: &Captures<'_>) -> bool {
    let Some(whole) = caps.get(0) else {
        return false;
    };
    if caps.get(3).is_some() || caps[2].len() != 2 {
        return false;
    }
    let before = text[..whole.start()].trim_end();
    let after_preposition = ["в", "к"]
        .iter()
        .any(|p| before == *p || before.ends_with(&format!(" {p}")));
    let hour: u32 = caps[1].parse().unwrap_or(99);
    let minute: u32 = caps[2].parse().unwrap_or(99);
    after_preposition && hour <= 23 && minute <= 59
}

fn local_instant(tz: &TimezoneSpec, date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    time_of_day(hour, minute).map(|t| tz.from_local(date.and_time(t)))
}

/// Apply the hour-ambiguity rule on a base date.
///
/// With `roll`, each candidate already behind `now` moves to the next day;
/// without it (the date was stated), past candidates are dropped.
fn resolve_on_date(
    date: NaiveDate,
    clock: &ClockTime,
    now: DateTime<Utc>,
    tz: &TimezoneSpec,
    roll: bool,
) -> TemporalIntent {
    let place = |day: NaiveDate, hour: u32| -> Option<DateTime<Utc>> {
        let at = local_instant(tz, day, hour, clock.minute)?;
        if roll && at <= now {
            local_instant(tz, day + Duration::days(1), hour, clock.minute)
        } else {
            Some(at)
        }
    };

    match read_hour(clock.hour, clock.meridiem) {
        HourReading::Exact(h) => match place(date, h) {
            Some(at) => TemporalIntent::Absolute { at },
            None => TemporalIntent::Unresolved,
        },
        HourReading::Either(a, b) => {
            let raw: Vec<DateTime<Utc>> = [place(date, a), place(date, b)].into_iter().flatten().collect();
            let mut candidates: Vec<DateTime<Utc>> =
                raw.iter().copied().filter(|c| *c >= now).collect();
            candidates.sort();
            candidates.dedup();
            match candidates.len() {
                0 => match raw.iter().max() {
                    Some(at) => TemporalIntent::Absolute { at: *at },
                    None => TemporalIntent::Unresolved,
                },
                1 => TemporalIntent::Absolute { at: candidates[0] },
                _ => TemporalIntent::Ambiguous {
                    candidates,
                    rule: None,
                },
            }
        }
    }
}

/// Give a wall-clock rule its time; ambiguous hours become two first occurrences.
fn rule_at_clock(rule: RecurrenceRule, clock: &ClockTime, now: DateTime<Utc>) -> TemporalIntent {
    match read_hour(clock.hour, clock.meridiem) {
        HourReading::Exact(h) => match time_of_day(h, clock.minute) {
            Some(t) => TemporalIntent::Recurring { rule: rule.at(t) },
            None => TemporalIntent::Unresolved,
        },
        HourReading::Either(a, b) => {
            let mut candidates: Vec<DateTime<Utc>> = [a, b]
                .into_iter()
                .filter_map(|h| time_of_day(h, clock.minute))
                .filter_map(|t| next_occurrence(&rule.clone().at(t), now).ok())
                .collect();
            candidates.sort();
            candidates.dedup();
            TemporalIntent::Ambiguous {
                candidates,
                rule: Some(rule),
            }
        }
    }
}
