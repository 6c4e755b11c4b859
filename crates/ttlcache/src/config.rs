use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::level_filters::LevelFilter;

/// How log lines are rendered.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `pretty` when attached to a terminal, `simplified` otherwise.
    #[default]
    Auto,
    /// Multi-line and colored.
    Pretty,
    /// One line per event, without colors.
    Simplified,
    /// One JSON object per event.
    Json,
}

/// The `logging` config section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// Maximum level of events emitted by this crate, unless overridden by `RUST_LOG`.
    #[serde(with = "level_filter")]
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::default(),
        }
    }
}

/// The `metrics` config section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// `host:port` of the statsd server. Defaults to `$STATSD_SERVER`, metrics are off without it.
    pub statsd: Option<String>,
    /// Prepended to the name of every metric.
    pub prefix: String,
    /// Tags sent along with every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "ttlcache".into(),
            custom_tags: Default::default(),
        }
    }
}

/// Defaults for cached operations.
///
/// These are the values a [`CachingOptions`](crate::caching::CachingOptions) starts out with
/// when created via [`CachingOptions::from_config`](crate::caching::CachingOptions::from_config).
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CachingConfig {
    /// Time-to-live of freshly written records.
    ///
    /// `null` means records never expire.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Option<Duration>,

    /// Whether expired records are served one last time before being dropped.
    pub is_lazy: bool,

    /// Prefix that is part of every derived cache key.
    pub prefix: String,

    /// Whether serving a stale record also kicks off a background recomputation.
    pub refresh_stale: bool,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            default_ttl: Some(Duration::from_secs(60)),
            is_lazy: true,
            prefix: "default".into(),
            refresh_stale: false,
        }
    }
}

/// The backend records are persisted in.
#[derive(Debug, Clone, Default, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Keep records in process memory.
    #[default]
    Memory,
    /// Keep one JSON file per record below `path`.
    Filesystem { path: PathBuf },
}

/// The complete configuration, usually loaded from a YAML file with [`Config::get`].
///
/// All sections and fields are optional. Unknown fields are ignored.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub logging: Logging,

    pub metrics: Metrics,

    /// Defaults for cached operations.
    pub caching: CachingConfig,

    /// Where records are stored.
    pub storage: StorageConfig,
}

impl Config {
    /// Loads the configuration from the YAML file at `path`, or the defaults if `path` is `None`.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let file = fs::File::open(path)
            .with_context(|| format!("cannot open config file {}", path.display()))?;
        Self::from_reader(file)
    }

    fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut yaml = String::new();
        reader
            .read_to_string(&mut yaml)
            .context("cannot read config file")?;

        // serde_yaml would happily turn an empty document into the defaults
        anyhow::ensure!(!yaml.trim().is_empty(), "config file is empty");
        serde_yaml::from_str(&yaml).context("invalid config YAML")
    }
}

/// Deserializes a [`LevelFilter`] from its lowercase name.
mod level_filter {
    use std::borrow::Cow;

    use serde::{Deserialize, Deserializer, de};
    use tracing::level_filters::LevelFilter;

    const LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

    pub fn deserialize<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = Cow::<str>::deserialize(deserializer)?;
        name.parse()
            .map_err(|_| de::Error::unknown_variant(&name, LEVELS))
    }
}
