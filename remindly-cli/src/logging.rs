//! Logs go to `~/.remindly/logs/remindly.log.<date>` so the chat stays clean.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::state::ensure_remindly_home;

/// Keeps the background writer alive; pending lines flush on drop.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

pub fn log_dir() -> Result<PathBuf> {
    Ok(ensure_remindly_home()?.join("logs"))
}

/// `RUST_LOG` wins over the configured level.
pub fn init(level: &str) -> Result<LoggingGuard> {
    let dir = log_dir()?;
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;

    let appender = RollingFileAppender::new(Rotation::DAILY, &dir, "remindly.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init()
        .context("install tracing subscriber")?;

    tracing::info!(log_dir = %dir.display(), level, "logging initialized");
    Ok(LoggingGuard { _guard: guard })
}
