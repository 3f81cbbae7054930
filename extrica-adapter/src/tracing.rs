use snafu::{ResultExt, Snafu};
use tracing::{level_filters::LevelFilter, subscriber::SetGlobalDefaultError};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to set global tracing subscriber"))]
    SetGlobalTracingSubscriber { source: SetGlobalDefaultError },
}

/// Logs to stderr, so that results printed to stdout stay machine readable.
pub fn init() -> Result<(), Error> {
    let env_filter_layer = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let console_output_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter_layer);

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(console_output_layer),
    )
    .context(SetGlobalTracingSubscriberSnafu)
}
