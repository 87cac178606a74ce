use anyhow::{Context, Result};
use remindly_core::{OwnerId, TimezoneSpec, parse_timezone};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// `$REMINDLY_HOME`, or `~/.remindly`.
pub fn remindly_home() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("REMINDLY_HOME") {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = std::env::var("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".remindly"))
}

pub fn ensure_remindly_home() -> Result<PathBuf> {
    let dir = remindly_home()?;
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    Ok(dir)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub owner_id: OwnerId,
    pub created_at_utc: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "+03:00".to_string()
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            owner_id: 1,
            created_at_utc: None,
            timezone: default_timezone(),
        }
    }
}

impl Profile {
    pub fn timezone_spec(&self) -> Result<TimezoneSpec> {
        parse_timezone(&self.timezone)
            .with_context(|| format!("profile timezone {:?}", self.timezone))
    }
}

pub fn profile_path() -> Result<PathBuf> {
    Ok(ensure_remindly_home()?.join("profile.json"))
}

pub fn reminders_path() -> Result<PathBuf> {
    Ok(ensure_remindly_home()?.join("reminders.json"))
}

pub fn write_profile(profile: &Profile) -> Result<()> {
    let p = profile_path()?;
    let json = serde_json::to_string_pretty(profile)?;
    fs::write(&p, json).with_context(|| format!("write {}", p.display()))?;
    Ok(())
}

pub fn read_profile() -> Result<Profile> {
    let p = profile_path()?;
    if !p.exists() {
        return Ok(Profile::default());
    }
    let s = fs::read_to_string(&p).with_context(|| format!("read {}", p.display()))?;
    serde_json::from_str(&s).with_context(|| format!("parse {}", p.display()))
}
