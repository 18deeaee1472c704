use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Build the default filter directive for a verbosity count (`-v` flags)
pub fn default_directive(verbosity: u8) -> String {
    match verbosity {
        0 => "warn".to_string(),
        1 => "warn,proxyssh=info".to_string(),
        2 => "info,proxyssh=debug".to_string(),
        _ => "debug,proxyssh=trace".to_string(),
    }
}

/// Initialize logging for the application
///
/// Logs go to stderr: stdout belongs to the remote shell.
pub fn init(verbosity: u8) {
    // RUST_LOG wins over the -v flags
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    tracing::debug!("Logging initialized (verbosity {})", verbosity);
}
