//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Build the filter: `-v` flags win, then `RUST_LOG`, then the configured level.
fn build_filter(verbose: u8, default_level: &str) -> EnvFilter {
    match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::try_new(default_level).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log level '{}', using info", default_level);
                EnvFilter::new("info")
            })
        }),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    }
}

/// Install the global subscriber, writing to stderr so stdout stays parseable.
///
/// Subsequent calls are silently ignored.
pub fn init(verbose: u8, default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(verbose, default_level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
