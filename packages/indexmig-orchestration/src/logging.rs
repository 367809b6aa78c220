//! Tracing setup

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default directive when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,indexmig_orchestration=debug";

/// Install a stderr `fmt` subscriber filtered by `RUST_LOG` (or `default_filter`)
///
/// Returns false when a global subscriber was already installed, which makes
/// repeated calls harmless.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .try_init()
        .is_ok()
}
