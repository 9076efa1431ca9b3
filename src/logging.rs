use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Installs a global subscriber printing log lines to stderr and rendering the
/// progress bars of running steps.
///
/// The filter defaults to `info` and can be overridden with `RUST_LOG`.
/// Fails if another global subscriber is already installed.
pub fn init_logging() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()?;

    Ok(())
}
