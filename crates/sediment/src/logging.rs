use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the process-wide subscriber: INFO by default, overridable with
/// `RUST_LOG`, writing to stderr. Panics if called twice.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}
