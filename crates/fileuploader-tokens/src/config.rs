//! Configuration, read from a YAML file.
//!
//! Every field has a default, so an empty mapping (`{}`) is a valid configuration. Durations are
//! written in human units, like `15s` or `5m`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Output format of the log.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `pretty` on a terminal, `simplified` everywhere else.
    #[default]
    Auto,
    /// Multi-line and colored.
    Pretty,
    /// One line per event, no colors.
    Simplified,
    /// One JSON object per event.
    Json,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// Maximum level of events to log. `RUST_LOG` takes precedence.
    #[serde(deserialize_with = "level_from_str")]
    pub level: LevelFilter,
    pub format: LogFormat,
    /// Sets `RUST_BACKTRACE=1` on startup.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::default(),
            enable_backtraces: true,
        }
    }
}

/// Where and how to report metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// `host:port` of the statsd server. Taken from `STATSD_SERVER` if not configured.
    pub statsd: Option<String>,
    pub prefix: String,
    /// Tags attached to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: std::env::var("STATSD_SERVER").ok(),
            prefix: "fileuploader".to_owned(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning of token acquisition and caching.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct TokenConfig {
    /// Maximum age of a cached token before it is requested again.
    #[serde(with = "humantime_serde")]
    pub max_token_age: Duration,

    /// How long a peer that rejected `EXTJWT` as an unknown command is left alone.
    #[serde(with = "humantime_serde")]
    pub unsupported_ttl: Duration,

    /// How long to wait for the complete token response.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Optional service name sent along with the token request.
    ///
    /// By default the server's own token is requested.
    pub service: Option<String>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            max_token_age: Duration::from_secs(15),
            unsupported_ttl: Duration::from_secs(5 * 60),
            request_timeout: Duration::from_secs(10),
            service: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: Logging,
    pub metrics: Metrics,
    /// Internal errors are sent here, if set.
    pub sentry_dsn: Option<Dsn>,
    pub tokens: TokenConfig,
}

impl Config {
    /// Reads the configuration file at `path`, or returns the defaults without a path.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&yaml)
    }

    fn from_yaml(yaml: &str) -> Result<Self> {
        // serde_yaml turns an empty document into the defaults, which hides a truncated file
        if yaml.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(yaml).context("failed to parse config YAML")
    }
}

fn level_from_str<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LevelFilter, D::Error> {
    const LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

    let level = String::deserialize(deserializer)?;
    level
        .parse()
        .map_err(|_| de::Error::unknown_variant(&level, LEVELS))
}
