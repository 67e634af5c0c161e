//! Subscriber setup for processes that run goblet.
//!
//! The engine logs through the `log` facade under the `goblet::deployer`,
//! `goblet::dispatch` and `goblet::client` targets. These helpers install a
//! `tracing` subscriber that also captures those records.

use std::sync::Once;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directives, e.g. `debug` or `goblet::deployer=debug,info`.
pub const LOG_LEVEL_ENV: &str = "GOBLET_LOG_LEVEL";

static INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line, for Cloud Logging.
    Json,
}

/// `GOBLET_LOG_LEVEL`, else `info`. Invalid directives fall back to `info`.
pub fn env_filter() -> EnvFilter {
    std::env::var(LOG_LEVEL_ENV)
        .ok()
        .filter(|level| !level.trim().is_empty())
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install the text subscriber. Later calls are no-ops.
pub fn init() {
    init_with(LogFormat::Text);
}

/// Install the JSON subscriber. Later calls are no-ops.
pub fn init_json() {
    init_with(LogFormat::Json);
}

pub fn init_with(format: LogFormat) {
    INIT.call_once(|| {
        let registry = tracing_subscriber::registry().with(env_filter());
        // try_init also bridges `log` records; it fails only when the host
        // already installed a global subscriber, which then stays in charge.
        let installed = match format {
            LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        };
        if installed.is_err() {
            tracing::debug!(target: "goblet::client", "global subscriber already set");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init_json();
        init();
        log::info!(target: "goblet::deployer", "logging initialised");
    }
}
