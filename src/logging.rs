use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Logs go to stderr so stdout stays a clean transcript.
///
/// `RUST_LOG` wins when set; otherwise `pilot=info`, or `pilot=debug` when verbose.
pub fn init(verbose: bool) {
    let fallback = if verbose { "pilot=debug" } else { "pilot=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
