//! Logging configuration and initialization
//!
//! Centralized logging setup using the `tracing` ecosystem.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info", "streamforge=trace")
//! - `STREAMFORGE_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Default log level when no environment variable is set
const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable for log level override
const LOG_LEVEL_ENV: &str = "STREAMFORGE_LOG_LEVEL";

/// Initialize tracing for the process.
///
/// Safe to call more than once; only the first call installs a subscriber.
/// `RUST_LOG` takes precedence over `STREAMFORGE_LOG_LEVEL`.
pub fn init_logging() {
    TRACING_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level =
                std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());
            EnvFilter::new(level)
        });

        // try_init so embedding applications that installed their own
        // subscriber keep it.
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_logging();
        init_logging();
    }
}
