// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Registry, fmt, fmt::writer::BoxMakeWriter, layer::SubscriberExt,
};

use crate::cfg::config::LogSettings;

/// Expands `%`-style date patterns in a log file template against the
/// current local time. A template chrono cannot format is used verbatim.
pub fn expand_log_template(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    if write!(&mut out, "{}", Local::now().format(template)).is_err() {
        return template.to_string();
    }
    out
}

/// Initialises the global tracing subscriber per the hub's log settings.
/// Level filtering follows `RUST_LOG` when set, defaulting to `info`. The
/// returned guard must stay alive for the non-blocking writer to flush.
pub fn init_logger(log: &LogSettings) -> Result<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, guard, ansi) = make_writer(log)?;

    let fmt_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false);

    let subscriber = Registry::default().with(env_filter).with(fmt_layer);

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global default subscriber")?;

    Ok(guard)
}

fn make_writer(log: &LogSettings) -> Result<(BoxMakeWriter, WorkerGuard, bool)> {
    if log.enabled && !log.file.is_empty() {
        let path = PathBuf::from(expand_log_template(&log.file));
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {dir:?}"))?;

        let appender = tracing_appender::rolling::never(
            dir,
            path.file_name().unwrap_or_default(),
        );
        let (w, g) = tracing_appender::non_blocking(appender);
        Ok((BoxMakeWriter::new(w), g, false))
    } else {
        let (w, g) = tracing_appender::non_blocking(std::io::stdout());
        Ok((BoxMakeWriter::new(w), g, true))
    }
}
