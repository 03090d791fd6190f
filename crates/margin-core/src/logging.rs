//! Process-wide `tracing` subscriber setup.

use std::env;
use std::sync::OnceLock;

use tracing_subscriber::{fmt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Default directive when neither `MARGIN_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Install a fmt subscriber filtered by `MARGIN_LOG`, then `RUST_LOG`.
///
/// Safe to call more than once and from hosts that already installed their
/// own subscriber; later calls are no-ops.
pub fn init_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let directives = log_directives();
        let filter = EnvFilter::try_new(&directives)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

        let installed = fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok();

        if installed {
            tracing::debug!(filter = %directives, "logging initialized");
        }
    });
}

fn log_directives() -> String {
    ["MARGIN_LOG", "RUST_LOG"]
        .into_iter()
        .filter_map(|name| env::var(name).ok())
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| String::from(DEFAULT_LOG_FILTER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_logging();
        init_logging();
        tracing::info!("still logging");
    }
}
