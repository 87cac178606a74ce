use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use remindly_core::{ReminderStore, TimezoneSpec, parse_timezone};

mod auth;
mod chat;
mod config;
mod llm;
mod logging;
mod setup;
mod state;
mod store;

#[derive(Parser, Debug)]
#[command(
    name = "remindly",
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("REMINDLY_BUILD_SHA"), ")"),
    about = "Reminders from plain Russian text"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pick a timezone and write ~/.remindly/profile.json and config.toml
    Setup,

    /// Interactive chat: create, list and manage reminders; fired ones show up inline
    Chat,

    /// Run the rule parser on one text and print the outcome
    Parse {
        text: String,

        /// Timezone for the reference instant (default: profile timezone)
        #[arg(long)]
        tz: Option<String>,
    },

    /// Print active reminders
    List,

    /// Show or change the profile timezone
    Tz { zone: Option<String> },

    /// Config file helpers
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Store provider API keys for the model fallback
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write a default config.toml if none exists
    Init,
    /// Print the effective config
    Show,
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    PasteOpenaiApiKey,
    PasteAnthropicToken,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config()?;
    let _log = logging::init(&cfg.logging.level)?;

    match cli.command {
        Command::Setup => setup::run_setup()?,
        Command::Chat => chat::run_chat(cfg).await?,
        Command::Parse { text, tz } => parse_once(&text, tz.as_deref())?,
        Command::List => {
            let profile = state::read_profile()?;
            let path = state::reminders_path()?;
            let store = store::FileStore::open(&path)
                .with_context(|| format!("open {}", path.display()))?;
            println!("{}", chat::render_list(&store.list_active(profile.owner_id)?));
        }
        Command::Tz { zone } => {
            let mut profile = state::read_profile()?;
            if let Some(zone) = zone {
                let spec = parse_timezone(&zone).with_context(|| format!("timezone {zone:?}"))?;
                profile.timezone = spec.to_string();
                state::write_profile(&profile)?;
            }
            println!("{}", profile.timezone);
        }
        Command::Config { command } => match command {
            ConfigCommand::Init => config::init_config()?,
            ConfigCommand::Show => {
                println!("# {}", config::config_path()?.display());
                print!("{}", toml::to_string_pretty(&cfg).context("serialize config")?);
            }
        },
        Command::Auth { command } => match command {
            AuthCommand::PasteOpenaiApiKey => auth::openai_paste_api_key()?,
            AuthCommand::PasteAnthropicToken => auth::anthropic_paste_token()?,
        },
    }

    Ok(())
}

fn parse_once(text: &str, tz: Option<&str>) -> Result<()> {
    let tz: TimezoneSpec = match tz {
        Some(zone) => parse_timezone(zone).with_context(|| format!("timezone {zone:?}"))?,
        None => state::read_profile()?.timezone_spec()?,
    };
    let parser = remindly_core::Parser::new()?;
    let outcome = parser.parse(text, chrono::Utc::now(), &tz);
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if let Some(at) = outcome.intent.fire_at() {
        println!("→ {}", remindly_core::format_local(at, &tz));
    }
    Ok(())
}
