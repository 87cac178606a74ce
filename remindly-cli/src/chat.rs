//! Line-oriented chat transport: one terminal, one owner.

use anyhow::{Context, Result};
use chrono::Duration;
use remindly_core::{
    Assistant, CITY_PRESETS, Error, FallbackResolver, NotificationAction, NotificationPayload,
    Notifier, Reminder, ReminderStore, Reply, SystemClock, TimezoneSpec, parse_timezone,
};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::llm::{Fallback, LlmResolver};
use crate::state::{read_profile, reminders_path, write_profile};
use crate::store::FileStore;

const HELP: &str = "\
Пиши напоминание обычным текстом, например «завтра в 15 позвонить маме».
Команды:
  /pick N          выбрать вариант N из предложенных
  /list            активные напоминания
  /done ID         отметить выполненным
  /snooze ID MIN   отложить на MIN минут
  /delete ID       удалить
  /tz [ЗОНА]       показать или сменить часовой пояс (+03:00, Europe/Moscow, Москва)
  /cancel          отменить текущее уточнение
  /quit            выход";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Help,
    Pick(usize),
    List,
    Done(String),
    Snooze(String, i64),
    Delete(String),
    Tz(Option<String>),
    Cancel,
    Quit,
}

/// Longest snooze the REPL accepts: one year.
const MAX_SNOOZE_MINUTES: i64 = 60 * 24 * 365;

/// `None` for plain text; `Some(Err(usage))` for a malformed command.
fn parse_command(line: &str) -> Option<Result<Command, &'static str>> {
    let rest = line.trim().strip_prefix('/')?;
    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default().to_lowercase();
    let args: Vec<&str> = parts.collect();

    let cmd = match (name.as_str(), args.as_slice()) {
        ("help" | "?", _) => Ok(Command::Help),
        ("pick", [n]) => match n.parse::<usize>() {
            Ok(n) if n >= 1 => Ok(Command::Pick(n - 1)),
            _ => Err("/pick N, где N начинается с 1"),
        },
        ("pick", _) => Err("/pick N"),
        ("list" | "ls", _) => Ok(Command::List),
        ("done", [id]) => Ok(Command::Done(id.to_string())),
        ("done", _) => Err("/done ID"),
        ("snooze", [id, minutes]) => match minutes.parse::<i64>() {
            Ok(m) if (1..=MAX_SNOOZE_MINUTES).contains(&m) => Ok(Command::Snooze(id.to_string(), m)),
            _ => Err("/snooze ID MIN, где MIN от 1 до 525600"),
        },
        ("snooze", _) => Err("/snooze ID MIN"),
        ("delete" | "rm", [id]) => Ok(Command::Delete(id.to_string())),
        ("delete" | "rm", _) => Err("/delete ID"),
        ("tz", []) => Ok(Command::Tz(None)),
        ("tz", zone) => Ok(Command::Tz(Some(zone.join(" ")))),
        ("cancel", _) => Ok(Command::Cancel),
        ("quit" | "exit" | "q", _) => Ok(Command::Quit),
        _ => Err("неизвестная команда, /help покажет список"),
    };
    Some(cmd)
}

/// Hands fired reminders to the REPL loop for printing.
struct ChannelNotifier(mpsc::UnboundedSender<NotificationPayload>);

impl Notifier for ChannelNotifier {
    async fn deliver(&self, payload: &NotificationPayload) -> remindly_core::Result<()> {
        self.0
            .send(payload.clone())
            .map_err(|_| Error::Delivery("terminal closed".into()))
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn render_reply(reply: &Reply) -> String {
    match reply {
        Reply::Confirmation { text, .. } => text.clone(),
        Reply::Prompt(prompt) if prompt.options.is_empty() => prompt.text.clone(),
        Reply::Prompt(prompt) => {
            let mut out = prompt.text.clone();
            for (i, option) in prompt.options.iter().enumerate() {
                out.push_str(&format!("\n  {}) {}", i + 1, option));
            }
            out.push_str("\n(/pick N)");
            out
        }
    }
}

fn render_notification(payload: &NotificationPayload) -> String {
    let id = short_id(&payload.reminder_id);
    let actions: Vec<String> = payload
        .actions
        .iter()
        .map(|a| match a {
            NotificationAction::Snooze { minutes } => format!("/snooze {id} {minutes}"),
            NotificationAction::Done => format!("/done {id}"),
        })
        .collect();
    format!("{}\n  [{}]", payload.text(), actions.join("  "))
}

pub fn render_list(reminders: &[Reminder]) -> String {
    if reminders.is_empty() {
        return "Активных напоминаний нет.".to_string();
    }
    reminders
        .iter()
        .map(|r| format!("{}  «{}» {}", short_id(&r.id), r.title, r.describe_schedule()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn prompt_marker() {
    print!("> ");
    std::io::stdout().flush().ok();
}

pub async fn run_chat(cfg: Config) -> Result<()> {
    let mut profile = read_profile()?;
    let mut tz = profile.timezone_spec()?;
    let owner = profile.owner_id;

    let path = reminders_path()?;
    let store =
        FileStore::open(&path).with_context(|| format!("open {}", path.display()))?;
    let fallback = match LlmResolver::from_config(&cfg.llm)? {
        Some(model) => Fallback::Model(model),
        None => Fallback::Disabled,
    };
    let (assistant, events) =
        Assistant::new(store, fallback, Arc::new(SystemClock), cfg.assistant())?;
    let assistant = Arc::new(assistant);
    let armed = assistant.reconcile_on_startup().await?;
    tracing::info!(owner, %tz, armed, "chat started");

    let (notify_tx, mut notifications) = mpsc::unbounded_channel();
    let fire_loop = tokio::spawn({
        let assistant = assistant.clone();
        async move {
            assistant
                .run_fire_loop(events, ChannelNotifier(notify_tx))
                .await
        }
    });

    println!("remindly · часовой пояс {tz} · активных напоминаний: {armed} · /help");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt_marker();
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("read stdin")? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match handle_line(&assistant, owner, &mut tz, line).await {
                    Ok(Some(out)) => println!("{out}"),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %format!("{e:#}"), "command failed");
                        println!("Ошибка: {e:#}");
                    }
                }
                if profile.timezone != tz.to_string() {
                    profile.timezone = tz.to_string();
                    write_profile(&profile)?;
                }
            }
            Some(payload) = notifications.recv() => {
                println!("\n{}", render_notification(&payload));
            }
        }
    }

    fire_loop.abort();
    Ok(())
}

/// Returns the text to print, or `None` to leave the loop.
async fn handle_line<S: ReminderStore, F: FallbackResolver>(
    assistant: &Assistant<S, F>,
    owner: i64,
    tz: &mut TimezoneSpec,
    line: &str,
) -> Result<Option<String>> {
    let Some(cmd) = parse_command(line) else {
        let reply = assistant.on_text(owner, line, *tz).await?;
        return Ok(Some(render_reply(&reply)));
    };
    let cmd = match cmd {
        Ok(cmd) => cmd,
        Err(usage) => return Ok(Some(format!("Использование: {usage}"))),
    };

    let out = match cmd {
        Command::Help => HELP.to_string(),
        Command::Quit => return Ok(None),
        Command::Pick(index) => render_reply(&assistant.on_pick(owner, index).await?),
        Command::List => render_list(&assistant.list(owner)?),
        Command::Done(id) => match assistant.done(owner, &id).await {
            Ok(r) => format!("✅ «{}» выполнено", r.title),
            Err(Error::NotFound(_)) => format!("Не нашёл напоминание {id}"),
            Err(e) => return Err(e.into()),
        },
        Command::Delete(id) => match assistant.delete(owner, &id).await {
            Ok(r) => format!("🗑 «{}» удалено", r.title),
            Err(Error::NotFound(_)) => format!("Не нашёл напоминание {id}"),
            Err(e) => return Err(e.into()),
        },
        Command::Snooze(id, minutes) => {
            match assistant.snooze(owner, &id, Duration::minutes(minutes)).await {
                Ok(reply) => render_reply(&reply),
                Err(Error::NotFound(_)) => format!("Не нашёл напоминание {id}"),
                Err(e) => return Err(e.into()),
            }
        }
        Command::Cancel => {
            if assistant.cancel_clarification(owner).await {
                "Уточнение отменено.".to_string()
            } else {
                "Нечего отменять.".to_string()
            }
        }
        Command::Tz(None) => {
            let presets: Vec<&str> = CITY_PRESETS.iter().map(|(label, _)| *label).collect();
            format!("Часовой пояс: {tz}\nГорода: {}", presets.join(", "))
        }
        Command::Tz(Some(zone)) => match parse_timezone(&zone) {
            Ok(spec) => {
                *tz = spec;
                format!("Часовой пояс: {spec}")
            }
            Err(_) => format!("Не знаю такой часовой пояс: {zone}"),
        },
    };
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use remindly_core::{AssistantConfig, ManualClock, MemoryStore, NoFallback};

    #[test]
    fn commands() {
        assert_eq!(parse_command("завтра в 7"), None);
        assert_eq!(parse_command("/pick 2"), Some(Ok(Command::Pick(1))));
        assert!(matches!(parse_command("/pick 0"), Some(Err(_))));
        assert_eq!(
            parse_command("/snooze ab12cd34 15"),
            Some(Ok(Command::Snooze("ab12cd34".into(), 15)))
        );
        assert!(matches!(parse_command("/snooze ab12cd34"), Some(Err(_))));
        assert!(matches!(parse_command("/snooze ab12cd34 99999999999999"), Some(Err(_))));
        assert_eq!(
            parse_command("/tz Europe/Moscow"),
            Some(Ok(Command::Tz(Some("Europe/Moscow".into()))))
        );
        assert_eq!(parse_command(" /QUIT "), Some(Ok(Command::Quit)));
        assert!(matches!(parse_command("/dance"), Some(Err(_))));
    }

    #[test]
    fn prompt_options_are_numbered_from_one() {
        let reply = Reply::Prompt(remindly_core::Prompt::with_options(
            "Уточни, пожалуйста, время:",
            vec!["17.10 в 07:00".into(), "17.10 в 19:00".into()],
        ));
        assert_eq!(
            render_reply(&reply),
            "Уточни, пожалуйста, время:\n  1) 17.10 в 07:00\n  2) 17.10 в 19:00\n(/pick N)"
        );
    }

    #[test]
    fn notification_lists_actions_as_commands() {
        let payload = NotificationPayload {
            reminder_id: "0123456789abcdef".into(),
            owner_id: 1,
            title: "Чай".into(),
            note: None,
            recurring: false,
            actions: vec![
                NotificationAction::Snooze { minutes: 10 },
                NotificationAction::Done,
            ],
        };
        assert_eq!(
            render_notification(&payload),
            "🔔 «Чай»\n  [/snooze 01234567 10  /done 01234567]"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn session_through_commands() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 16, 7, 0, 0).unwrap(),
        ));
        let (assistant, _events) = Assistant::new(
            MemoryStore::new(),
            NoFallback,
            clock,
            AssistantConfig::default(),
        )
        .unwrap();
        let mut tz = TimezoneSpec::Fixed(180);

        let out = handle_line(&assistant, 1, &mut tz, "завтра в 7 позвонить маме")
            .await
            .unwrap()
            .unwrap();
        assert!(out.ends_with("(/pick N)"));

        let out = handle_line(&assistant, 1, &mut tz, "/pick 2").await.unwrap().unwrap();
        assert_eq!(out, "📅 Окей, напомню «Позвонить маме» 17.10 в 19:00");

        let out = handle_line(&assistant, 1, &mut tz, "/list").await.unwrap().unwrap();
        assert!(out.contains("«Позвонить маме»"));

        let out = handle_line(&assistant, 1, &mut tz, "/tz Калининград").await.unwrap().unwrap();
        assert_eq!(out, "Часовой пояс: +02:00");
        assert_eq!(tz, TimezoneSpec::Fixed(120));

        let out = handle_line(&assistant, 1, &mut tz, "/done nope").await.unwrap().unwrap();
        assert_eq!(out, "Не нашёл напоминание nope");

        assert_eq!(handle_line(&assistant, 1, &mut tz, "/quit").await.unwrap(), None);
    }
}
