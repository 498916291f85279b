//! Tracing subscriber setup.
//!
//! `RUST_LOG`, when set, wins over the configured level so that single
//! modules can be turned up without editing the config file:
//!
//! ```text
//! RUST_LOG=piper_proto::ssh::piper=trace piperd --config piperd.toml
//! ```

use crate::config::LogFormat;
use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Builds the event filter from `RUST_LOG` or, failing that, `level`.
///
/// An unparsable `level` falls back to `info`.
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = build_filter(level);
    let result = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
    };
    result.map_err(|e| anyhow!("installing log subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_accepts_directives() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let filter = build_filter("warn,piper_proto=debug");
        assert!(filter.to_string().contains("piper_proto=debug"));
    }

    #[test]
    fn test_build_filter_falls_back() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert_eq!(build_filter("piper_proto=loud").to_string(), "info");
    }

    #[test]
    fn test_second_init_fails() {
        let _ = init_logging("info", LogFormat::Text);
        assert!(init_logging("info", LogFormat::Json).is_err());
    }
}
