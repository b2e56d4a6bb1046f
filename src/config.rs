use std::{net::SocketAddr, path::{Path, PathBuf}, time::Duration};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::stats::StatsConfig;

fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 1080))
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_eviction_interval() -> Duration {
    StatsConfig::default().eviction_interval
}

fn default_idle_threshold() -> Duration {
    StatsConfig::default().idle_threshold
}

#[serde_with::serde_as]
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatsSettings {
    /// StatsD `host:port`. Without it metrics are discarded.
    pub statsd_address: Option<String>,
    /// Prepended to every metric name, separated by a dot.
    pub prefix: Option<String>,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold: Duration,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            statsd_address: None,
            prefix: None,
            eviction_interval: default_eviction_interval(),
            idle_threshold: default_idle_threshold(),
        }
    }
}

impl StatsSettings {
    pub fn stats_config(&self) -> StatsConfig {
        StatsConfig {
            eviction_interval: self.eviction_interval,
            idle_threshold: self.idle_threshold,
        }
    }
}

#[serde_with::serde_as]
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,

    /// YAML allow-list consulted for every SOCKS5 request.
    pub filter_acl_rules_path: PathBuf,

    /// Upper bound for establishing the upstream connection.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
    #[serde(default)]
    pub tcp_nodelay: bool,

    #[serde(default)]
    pub stats: StatsSettings,
}

impl Settings {
    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let settings: Settings = toml::from_str(contents).context("while parsing settings")?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.stats.eviction_interval.is_zero() {
            bail!("stats.eviction-interval must be at least one second");
        }
        if self.request_timeout.is_zero() {
            bail!("request-timeout must be at least one second");
        }
        Ok(())
    }
}

pub fn load(path: &Path) -> anyhow::Result<Settings> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("while reading config file {}", path.display()))?;
    Settings::from_toml(&contents)
}
