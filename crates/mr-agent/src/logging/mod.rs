//! Structured logging for the agent.
//!
//! Two modes, both on stderr:
//! - Human-readable console output for interactive use
//! - JSON lines for running under a supervisor
//!
//! stdout is reserved for command payloads (stdout sink, `config show`,
//! rendered stats).

pub mod config;
pub mod layer;

pub use config::{LogConfig, LogFormat, LogLevel};
pub use layer::JsonlLayer;

use std::io::IsTerminal;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const CRATES: [&str; 3] = ["mr_agent", "mr_buffer", "mr_common"];

/// Default filter directive for our crates at `level`.
pub fn default_directive(level: LogLevel) -> String {
    CRATES
        .iter()
        .map(|krate| format!("{}={}", krate, level))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialize the global subscriber.
///
/// `RUST_LOG`, when it parses, replaces the computed filter. Calling this more
/// than once keeps the first subscriber.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config.level)));

    let result = match config.format {
        LogFormat::Human => {
            let use_ansi = std::io::stderr().is_terminal();
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(use_ansi);
            if config.timestamps {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer)
                    .try_init()
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer.without_time())
                    .try_init()
            }
        }
        LogFormat::Jsonl => tracing_subscriber::registry()
            .with(filter)
            .with(JsonlLayer::stderr())
            .try_init(),
    };
    if let Err(err) = result {
        tracing::debug!(error = %err, "logging already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_covers_every_crate() {
        assert_eq!(
            default_directive(LogLevel::Debug),
            "mr_agent=debug,mr_buffer=debug,mr_common=debug"
        );
    }

    #[test]
    fn init_twice_does_not_panic() {
        let config = LogConfig::default().with_level(LogLevel::Off);
        init_logging(&config);
        init_logging(&config);
    }
}
