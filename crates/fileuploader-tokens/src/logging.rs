use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;

/// Installs a global subscriber that writes one JSON object per event.
///
/// Token values never show up in these logs, only their length and age. Errors are forwarded
/// to Sentry if a client has been bound. Fails if a global subscriber is already installed.
pub fn init_json_logging<W>(directives: &str, make_writer: W) -> Result<(), TryInitError>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let json = tracing_subscriber::fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_writer(make_writer)
        .with_filter(EnvFilter::new(directives));

    tracing_subscriber::registry()
        .with(json)
        .with(sentry::integrations::tracing::layer())
        .try_init()
}
