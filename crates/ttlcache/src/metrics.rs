//! Statsd metrics for cache lookups and computations.
//!
//! Metrics are only emitted once [`init_metrics`] installed a client. Until then, and in tests,
//! the [`metric!`](crate::metric) macro does nothing.
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use cadence::{BufferedUdpMetricSink, StatsdClient};

use crate::config::Metrics;

static STATSD_CLIENT: OnceLock<StatsdClient> = OnceLock::new();

/// Re-exports the traits the [`metric!`](crate::metric) macro needs.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// Installs a statsd client reporting to `host`.
///
/// Every metric is prefixed with `prefix` and carries all of `tags`. The client can only be
/// installed once per process, later calls log a warning and keep the first client.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: &BTreeMap<String, String>,
) -> io::Result<()> {
    let addrs: Vec<_> = host.to_socket_addrs()?.collect();
    let Some(addr) = addrs.first() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "statsd host did not resolve",
        ));
    };

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = BufferedUdpMetricSink::from(addr, socket).map_err(io::Error::other)?;

    let client = tags
        .iter()
        .fold(StatsdClient::builder(prefix, sink), |builder, (key, value)| {
            builder.with_tag(key, value)
        })
        .with_error_handler(|error| tracing::debug!(%error, "Failed to send metric"))
        .build();

    match STATSD_CLIENT.set(client) {
        Ok(()) => tracing::info!("Reporting metrics to statsd at {}", addr),
        Err(_) => tracing::warn!("Statsd client already configured, ignoring {}", addr),
    }
    Ok(())
}

/// Configures statsd reporting from the `metrics` config section.
///
/// Does nothing if no statsd host is configured.
pub fn init_metrics(config: &Metrics) -> io::Result<()> {
    match config.statsd.as_deref() {
        Some(host) => configure_statsd(&config.prefix, host, &config.custom_tags),
        None => Ok(()),
    }
}

/// Runs `f` with the installed statsd client.
///
/// Returns `R::default()` without calling `f` if no client is installed.
#[inline]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&StatsdClient) -> R,
    R: Default,
{
    STATSD_CLIENT.get().map(f).unwrap_or_default()
}

/// Emits a counter, gauge or timer, with optional tags.
///
/// ```
/// # use std::time::Duration;
/// ttlcache::metric!(counter("caches.hit") += 1);
/// ttlcache::metric!(gauge("caches.computations") = 3u64, "backend" => "memory");
/// ttlcache::metric!(timer("caches.computation.duration") = Duration::from_millis(5));
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| {
            use $crate::metrics::prelude::*;
            client.count_with_tags($id, $value)$(.with_tag($k, $v))*.send();
        })
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| {
            use $crate::metrics::prelude::*;
            client.gauge_with_tags($id, $value)$(.with_tag($k, $v))*.send();
        })
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| {
            use $crate::metrics::prelude::*;
            client.time_with_tags($id, $value)$(.with_tag($k, $v))*.send();
        })
    };
}
