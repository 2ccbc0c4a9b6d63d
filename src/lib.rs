pub mod federation;

/// Initialize the tracing subscriber — writes to stderr so stdout stays a
/// clean JSON-RPC channel.
///
/// The filter defaults to `mcpgate=info,warn` and can be overridden with
/// `RUST_LOG`. Logs a startup banner with the version and pid.
pub fn init_tracing() {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcpgate=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "=== mcpgate starting ==="
    );
}
