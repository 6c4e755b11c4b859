use std::borrow::Cow;
use std::env;

use sentry::integrations::tracing::EventFilter;
use tracing::level_filters::LevelFilter;
use tracing::{Level, Metadata, Subscriber};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{Config, LogFormat};

/// The filter directives used when `RUST_LOG` is not set.
///
/// Debug and trace output is only enabled for this crate, dependencies stay at `INFO`.
fn default_directives(level: LevelFilter) -> Cow<'static, str> {
    match level.into_level() {
        None => Cow::Borrowed("off"),
        Some(level) if level <= Level::INFO => Cow::Borrowed(level.as_str()),
        Some(level) => Cow::Owned(format!("INFO,ttlcache={level}")),
    }
}

fn fmt_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer().with_timer(UtcTime::rfc_3339());

    let pretty = match format {
        LogFormat::Auto => console::user_attended(),
        LogFormat::Pretty => true,
        LogFormat::Simplified => false,
        LogFormat::Json => {
            return layer
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_file(true)
                .with_line_number(true)
                .boxed();
        }
    };

    match pretty {
        true => layer.pretty().boxed(),
        false => layer.compact().with_ansi(false).boxed(),
    }
}

/// Errors are reported to sentry, `INFO` and `WARN` are attached to them as breadcrumbs.
fn sentry_event_filter(metadata: &Metadata<'_>) -> EventFilter {
    match *metadata.level() {
        Level::ERROR => EventFilter::Event,
        Level::WARN | Level::INFO => EventFilter::Breadcrumb,
        Level::DEBUG | Level::TRACE => EventFilter::Ignore,
    }
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Events also flow into sentry, which
/// only has an effect once a sentry client is bound.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &Config) -> Result<(), TryInitError> {
    let directives = env::var("RUST_LOG")
        .map(Cow::Owned)
        .unwrap_or_else(|_| default_directives(config.logging.level));

    tracing_subscriber::registry()
        .with(fmt_layer(config.logging.format).with_filter(EnvFilter::new(directives)))
        .with(sentry::integrations::tracing::layer().event_filter(sentry_event_filter))
        .try_init()
}
