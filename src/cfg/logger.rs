// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Logger initialization (ambient stack, SPEC_FULL.md §"Ambient: logging").
//!
//! A `tracing_subscriber::fmt` layer filtered by `EnvFilter`, guarded by a
//! `once_cell::sync::OnceCell` so repeated calls (tests spinning up
//! multiple clients in one process) don't panic on a second
//! `set_global_default`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static LOGGER_GUARD: OnceCell<Option<WorkerGuard>> = OnceCell::new();

#[derive(Debug, Deserialize, Clone)]
pub struct LoggerConfig {
    pub logger: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum Output {
    Stdout,
    Stderr,
    File,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum RotationFreq {
    Minutely,
    Hourly,
    Daily,
    Never,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogFileConfig {
    pub path: String,
    #[serde(default)]
    pub rotation_frequency: Option<RotationFreq>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    pub level: String,
    pub output: Output,
    #[serde(default)]
    pub with_target: bool,
    pub file: Option<LogFileConfig>,
}

/// Initializes the global tracing subscriber from a YAML config file. Safe
/// to call more than once per process — every call after the first is a
/// no-op that returns `Ok(())`.
pub fn init_logger(config_path: &str) -> Result<()> {
    if LOGGER_GUARD.get().is_some() {
        return Ok(());
    }

    let config_content = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read logger config: {config_path}"))?;
    let config: LoggerConfig = serde_yaml::from_str(&config_content)
        .with_context(|| format!("failed to parse logger config: {config_path}"))?;

    init_logger_from_config(config.logger)
}

/// As [`init_logger`] but from an already-deserialized [`LogConfig`] —
/// used by [`crate::cfg::config::ClientConfig`] to drive logging from the
/// same file as the rest of the client's configuration.
pub fn init_logger_from_config(cfg: LogConfig) -> Result<()> {
    if LOGGER_GUARD.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_new(&cfg.level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("failed to parse log level from config or env")?;

    let with_target = cfg.with_target;
    let guard = match cfg.output {
        Output::Stdout => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(writer).with_target(with_target))
                .try_init()
                .context("failed to set global default subscriber")?;
            guard
        },
        Output::Stderr => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(writer).with_target(with_target))
                .try_init()
                .context("failed to set global default subscriber")?;
            guard
        },
        Output::File => {
            let file_cfg = cfg.file.context("logger.file is required for output=file")?;
            let path = PathBuf::from(&file_cfg.path);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let rotation = match file_cfg.rotation_frequency.unwrap_or(RotationFreq::Never) {
                RotationFreq::Minutely => Rotation::MINUTELY,
                RotationFreq::Hourly => Rotation::HOURLY,
                RotationFreq::Daily => Rotation::DAILY,
                RotationFreq::Never => Rotation::NEVER,
            };
            let appender =
                RollingFileAppender::new(rotation, dir, path.file_name().unwrap_or_default());
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(writer).with_ansi(false).with_target(with_target))
                .try_init()
                .context("failed to set global default subscriber")?;
            guard
        },
    };

    let _ = LOGGER_GUARD.set(Some(guard));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdout_config_initializes_without_error() {
        let cfg = LogConfig {
            level: "info".to_string(),
            output: Output::Stdout,
            with_target: false,
            file: None,
        };
        // Calling twice (across tests in this process) must not panic.
        assert!(init_logger_from_config(cfg).is_ok());
    }
}
