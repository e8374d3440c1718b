//! Process-wide tracing subscriber

use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`)
///
/// Returns `false` if a subscriber was already installed by this function or
/// by someone else; later calls are no-ops.
pub fn init_tracing() -> bool {
    init_with_default("info")
}

/// Same as [`init_tracing`] with an explicit fallback directive
pub fn init_with_default(directive: &str) -> bool {
    if INITIALIZED.set(()).is_err() {
        return false;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);

    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
}
