use anyhow::{Context, Result};
use chrono::Duration;
use remindly_core::{AssistantConfig, ClarifyPolicy, RetryPolicy, SchedulerPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::state::ensure_remindly_home;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmSection,
    pub scheduler: SchedulerSection,
    pub clarify: ClarifySection,
    pub snooze: SnoozeSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// "openai", "anthropic" or "none".
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub max_attempts: u32,
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            max_attempts: 3,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub misfire_grace_secs: i64,
    pub catch_up_epsilon_secs: i64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            misfire_grace_secs: 60,
            catch_up_epsilon_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClarifySection {
    pub session_max_age_hours: i64,
    pub supersede_on_new_request: bool,
}

impl Default for ClarifySection {
    fn default() -> Self {
        Self {
            session_max_age_hours: 24,
            supersede_on_new_request: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnoozeSection {
    pub presets_minutes: Vec<i64>,
}

impl Default for SnoozeSection {
    fn default() -> Self {
        Self {
            presets_minutes: vec![10, 60],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn assistant(&self) -> AssistantConfig {
        AssistantConfig {
            clarify: ClarifyPolicy {
                max_age: Duration::hours(self.clarify.session_max_age_hours),
                supersede_on_new_request: self.clarify.supersede_on_new_request,
            },
            scheduler: SchedulerPolicy {
                misfire_grace: Duration::seconds(self.scheduler.misfire_grace_secs),
                catch_up_epsilon: Duration::seconds(self.scheduler.catch_up_epsilon_secs),
            },
            retry: RetryPolicy {
                attempts: self.llm.max_attempts,
                per_attempt: std::time::Duration::from_secs(self.llm.timeout_secs),
            },
            snooze_presets: self
                .snooze
                .presets_minutes
                .iter()
                .filter(|m| **m > 0)
                .map(|m| Duration::minutes(*m))
                .collect(),
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    Ok(ensure_remindly_home()?.join("config.toml"))
}

pub fn load_config() -> Result<Config> {
    let p = config_path()?;
    if !p.exists() {
        return Ok(Config::default());
    }
    let s = fs::read_to_string(&p).with_context(|| format!("read {}", p.display()))?;
    toml::from_str(&s).context("parse config.toml")
}

pub fn save_config(cfg: &Config) -> Result<()> {
    let p = config_path()?;
    let s = toml::to_string_pretty(cfg).context("serialize config")?;
    fs::write(&p, s).with_context(|| format!("write {}", p.display()))?;
    Ok(())
}

pub fn init_config() -> Result<()> {
    let p = config_path()?;
    if p.exists() {
        println!("Config already exists: {}", p.display());
        return Ok(());
    }
    save_config(&Config::default())?;
    println!("Wrote {}", p.display());
    Ok(())
}
