//! Statsd reporting.
//!
//! Nothing is reported until [`configure_statsd`] has been called. Until then, and in tests,
//! [`metric!`](crate::metric) does nothing.

use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static REPORTER: OnceLock<Reporter> = OnceLock::new();

/// Traits needed to build metrics with [`Reporter::client`].
pub mod prelude {
    pub use cadence::prelude::*;
}

/// The process-wide statsd client, along with tags added to every metric.
#[derive(Debug)]
pub struct Reporter {
    client: StatsdClient,
    default_tags: Vec<(String, String)>,
}

impl Reporter {
    pub fn client(&self) -> &StatsdClient {
        &self.client
    }

    /// Adds the default tags and sends the metric.
    #[inline(always)]
    pub fn emit<'a, T>(&'a self, metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.default_tags
            .iter()
            .fold(metric, |metric, (key, value)| metric.with_tag(key, value))
            .send()
    }
}

/// Starts reporting metrics to the statsd server at `host`.
///
/// Every metric name gets `prefix`, and every metric gets `tags`. Only the first successful call
/// has an effect.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> io::Result<()> {
    let addrs: Vec<_> = host.to_socket_addrs()?.collect();
    let Some(addr) = addrs.first() else {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "statsd host did not resolve",
        ));
    };
    tracing::info!(%addr, prefix, "Reporting metrics to statsd");

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).map_err(io::Error::other)?;

    let reporter = Reporter {
        client: StatsdClient::from_sink(prefix, sink),
        default_tags: tags.into_iter().collect(),
    };
    if REPORTER.set(reporter).is_err() {
        tracing::warn!("Metrics were configured twice, keeping the first configuration");
    }
    Ok(())
}

/// Calls `f` with the configured [`Reporter`], or returns the default if there is none.
#[inline(always)]
pub fn with_reporter<F, R>(f: F) -> R
where
    F: FnOnce(&Reporter) -> R,
    R: Default,
{
    REPORTER.get().map(f).unwrap_or_default()
}

/// Emits a counter, gauge or timer.
///
/// ```ignore
/// metric!(counter("tokens.request") += 1, "status" => "ok");
/// metric!(gauge("tokens.unsupported.peers") = 3);
/// metric!(timer("tokens.request.duration") = elapsed);
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@emit count_with_tags, $id, $value $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@emit gauge_with_tags, $id, $value $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@emit time_with_tags, $id, $value $(, $k => $v)*)
    };
    (@emit $method:ident, $id:expr, $value:expr $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_reporter(|reporter| {
            reporter.emit(reporter.client().$method($id, $value)$(.with_tag($k, $v))*);
        })
    }};
}
