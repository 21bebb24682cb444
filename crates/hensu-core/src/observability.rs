//! Structured logging setup, grounded in the teacher's own
//! `init_tracing` (`hydra-core/src/lib.rs`).

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Install a `tracing` subscriber reading `RUST_LOG`, defaulting to
/// `info` when unset or invalid.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
    info!("hensu tracing initialised");
}
