//! Logging setup for embedding hosts.

/// Initialize tracing output to stderr with `RUST_LOG`-style filtering.
///
/// Intended for hosts that embed the orchestrator and have no logging of
/// their own. Safe to call once per process; subsequent calls are ignored.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
