use anyhow::Result;
use tracing::Level;
use tracing_subscriber::{
    filter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

use vps_proxy::config::{Config, Settings};
use vps_proxy::daemon;

fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Config::parse_args();

    // Setup logging
    setup_logging(cli.debug);

    // Load settings
    let mut settings = Settings::load(cli.config.as_ref())?;
    settings.merge_cli(&cli);
    settings.validate();

    // Run the daemon
    daemon::run(settings)
}

/// Operational messages go to stdout; warnings and errors to stderr.
fn setup_logging(debug: bool) {
    let default = if debug {
        EnvFilter::new("vps_proxy=debug")
    } else {
        EnvFilter::new("vps_proxy=info")
    };
    let env_filter = EnvFilter::try_from_env("VPS_PROXY_LOG").unwrap_or(default);

    let stdout = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stdout)
        .with_filter(filter::filter_fn(|meta| *meta.level() >= Level::INFO));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter::filter_fn(|meta| *meta.level() <= Level::WARN));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout)
        .with(stderr)
        .init();
}
