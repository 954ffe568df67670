//! Tracing setup helper.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global tracing subscriber once, honoring `RUST_LOG`.
pub fn install_tracing_subscriber() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = fmt().with_env_filter(filter).try_init();
    });
}
