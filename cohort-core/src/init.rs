//! Process-wide initialization shared by binaries.
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a formatting subscriber filtered by `RUST_LOG`, defaulting to
/// `info`.
///
/// Logs go to stderr so that PEs writing results to stdout are not disturbed.
/// Does nothing if a global subscriber is already installed.
pub fn tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(filter)
        .try_init();
}
