//! Tracing subscriber setup.

use tracing::Subscriber;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Build the subscriber for `config`. `RUST_LOG` takes precedence over the
/// configured level.
pub fn build_subscriber(config: &LoggingConfig) -> Box<dyn Subscriber + Send + Sync> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.json {
        Box::new(
            fmt::Subscriber::builder()
                .with_env_filter(env_filter)
                .json()
                .with_current_span(false)
                .finish(),
        )
    } else {
        Box::new(
            fmt::Subscriber::builder()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_thread_ids(false)
                .finish(),
        )
    }
}

/// Install the global subscriber.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> bool {
    tracing::subscriber::set_global_default(build_subscriber(config)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    fn debug_enabled(config: &LoggingConfig) -> bool {
        tracing::subscriber::with_default(build_subscriber(config), || {
            tracing::enabled!(Level::DEBUG)
        })
    }

    #[test]
    fn test_configured_level_filters_events() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }

        let verbose = LoggingConfig {
            level: "debug".to_string(),
            json: true,
        };
        let quiet = LoggingConfig {
            level: "warn".to_string(),
            json: false,
        };

        assert!(debug_enabled(&verbose));
        assert!(!debug_enabled(&quiet));
    }

    #[test]
    fn test_unparseable_level_still_builds() {
        let config = LoggingConfig {
            level: "not a level ===".to_string(),
            json: false,
        };
        tracing::subscriber::with_default(build_subscriber(&config), || {
            tracing::info!("still logging");
        });
    }
}
