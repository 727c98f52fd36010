//! Process-wide tracing setup with a reloadable level.
//!
//! The caller passes its level to every runner on the command line; the
//! runner applies it with [`set_level`] so parent and worker log alike.

use std::sync::OnceLock;

use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt};

use crate::error::{Result, SprError};

/// Level used when neither `RUST_LOG` nor `SPR_LOG` is set.
pub const DEFAULT_LEVEL: &str = "info";

pub const LEVEL_ENV: &str = "SPR_LOG";

static FILTER: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Map a user-facing level name onto a filter directive.
pub fn normalize_level(level: &str) -> Option<&'static str> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" | "" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" | "fatal" | "panic" => Some("error"),
        "off" => Some("off"),
        _ => None,
    }
}

/// Install the stderr subscriber. `RUST_LOG` wins over `SPR_LOG`;
/// `LOG_FORMAT=json` switches to JSON lines. Safe to call more than once.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var(LEVEL_ENV)
            .ok()
            .and_then(|l| normalize_level(&l))
            .unwrap_or(DEFAULT_LEVEL);
        EnvFilter::new(level)
    };

    let (filter, handle) = reload::Layer::new(filter);
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    let installed = if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    if installed.is_ok() {
        let _ = FILTER.set(handle);
    }
}

/// Change the level of the subscriber installed by [`init_tracing`].
///
/// Returns `Ok(false)` when there is nothing to reload: no subscriber of ours
/// is installed, or `RUST_LOG` pins the filter.
pub fn set_level(level: &str) -> Result<bool> {
    let directive = normalize_level(level)
        .ok_or_else(|| SprError::invalid_param(format!("unknown log level {level:?}")))?;

    if std::env::var("RUST_LOG").is_ok() {
        tracing::debug!(level = directive, "RUST_LOG set, keeping its filter");
        return Ok(false);
    }
    let Some(handle) = FILTER.get() else {
        return Ok(false);
    };
    handle
        .reload(EnvFilter::new(directive))
        .map_err(|e| SprError::Internal(format!("reload log filter: {e}")))?;
    tracing::debug!(level = directive, "Log level changed");
    Ok(true)
}

/// Most verbose level currently enabled, as a name [`set_level`] accepts.
pub fn current_level() -> String {
    level_name(LevelFilter::current()).to_string()
}

fn level_name(filter: LevelFilter) -> &'static str {
    match filter.into_level() {
        Some(Level::TRACE) => "trace",
        Some(Level::DEBUG) => "debug",
        Some(Level::INFO) => "info",
        Some(Level::WARN) => "warn",
        Some(Level::ERROR) => "error",
        None => "off",
    }
}
