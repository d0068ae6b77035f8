use std::fs::OpenOptions;
use std::io;
use std::sync::{Mutex, Once};

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, Logging};

static INIT: Once = Once::new();

pub const LOG_ENV: &str = "SVCCTL_LOG";

/// Installs the global subscriber. Later calls are no-ops.
///
/// The filter comes from `SVCCTL_LOG`, then `RUST_LOG`, then the config, and
/// defaults to `info`. Output goes to the configured file, else stderr.
pub fn init(config: &Logging) -> Result<()> {
    let file = match &config.path {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?,
        ),
        None => None,
    };

    INIT.call_once(|| {
        let filter = env_filter(config.filter.as_deref());
        let registry = tracing_subscriber::registry().with(filter);
        match (config.format, file) {
            (LogFormat::Json, Some(file)) => registry
                .with(fmt::layer().json().with_ansi(false).with_writer(Mutex::new(file)))
                .init(),
            (LogFormat::Json, None) => registry
                .with(fmt::layer().json().with_writer(io::stderr))
                .init(),
            (LogFormat::Text, Some(file)) => registry
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .init(),
            (LogFormat::Text, None) => registry
                .with(fmt::layer().with_writer(io::stderr))
                .init(),
        }
        tracing::debug!(format = ?config.format, "logging initialized");
    });
    Ok(())
}

pub fn is_initialized() -> bool {
    INIT.is_completed()
}

fn env_filter(configured: Option<&str>) -> EnvFilter {
    let directives = std::env::var(LOG_ENV)
        .ok()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .or_else(|| configured.map(str::to_string));
    match directives {
        Some(directives) => EnvFilter::try_new(&directives).unwrap_or_else(|_| {
            eprintln!("invalid log filter '{}', using 'info'", directives);
            EnvFilter::new("info")
        }),
        None => EnvFilter::new("info"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let config = Logging::default();
        init(&config).unwrap();
        init(&config).unwrap();
        assert!(is_initialized());
    }

    #[test]
    fn unopenable_log_file_is_an_error() {
        let config = Logging {
            path: Some("/nonexistent-dir/svcctl.log".into()),
            ..Logging::default()
        };
        let err = init(&config).unwrap_err();
        assert!(err.to_string().contains("failed to open log file"));
    }

    #[test]
    fn bad_filters_fall_back() {
        // Must not panic.
        let _ = env_filter(Some("svcctl=[[["));
        let _ = env_filter(None);
    }
}
