use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::proxy::cache::{FetchLimits, SweepPolicy};

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_max_connections() -> usize {
    1024
}

fn default_client_timeout() -> u64 {
    30
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_io_chunk_size() -> usize {
    4096
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_max_entry_size() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_cache_total_capacity() -> u64 {
    2 * 1024 * 1024 * 1024 // 2 GiB
}

fn default_cache_evict_percent() -> u8 {
    80
}

fn default_cache_sweeper_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub listen: SocketAddr,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_io_chunk_size")]
    pub io_chunk_size: usize,
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_max_entry_size")]
    pub cache_max_entry_size: u64,
    #[serde(default = "default_cache_total_capacity")]
    pub cache_total_capacity: u64,
    #[serde(default = "default_cache_evict_percent")]
    pub cache_evict_percent: u8,
    #[serde(default = "default_cache_sweeper_interval")]
    pub cache_sweeper_interval: u64,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = resolve_config_path(cli)?;
        Self::load_from(&config_path)
    }

    /// Reads `path`, layers `FANOUT_PROXY__*` environment overrides on top and validates.
    pub fn load_from(path: &Path) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::from(path.to_path_buf()).required(true))
            .add_source(
                Environment::with_prefix("FANOUT_PROXY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(to_anyhow)?;
        let settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Settings with every optional field at its default.
    pub fn with_defaults(listen: SocketAddr) -> Self {
        Self {
            listen,
            log: default_log_format(),
            max_connections: default_max_connections(),
            client_timeout: default_client_timeout(),
            upstream_connect_timeout: default_upstream_connect_timeout(),
            upstream_timeout: default_upstream_timeout(),
            max_header_size: default_max_header_size(),
            io_chunk_size: default_io_chunk_size(),
            cache_enabled: default_cache_enabled(),
            cache_max_entry_size: default_cache_max_entry_size(),
            cache_total_capacity: default_cache_total_capacity(),
            cache_evict_percent: default_cache_evict_percent(),
            cache_sweeper_interval: default_cache_sweeper_interval(),
            metrics_listen: None,
        }
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn cache_sweeper_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweeper_interval)
    }

    pub fn sweep_policy(&self) -> SweepPolicy {
        SweepPolicy {
            threshold: self.cache_total_capacity,
            percent: self.cache_evict_percent,
        }
    }

    /// Limits applied by the task that fetches a shared response from the origin.
    pub fn fetch_limits(&self) -> FetchLimits {
        FetchLimits {
            connect_timeout: self.upstream_connect_timeout(),
            io_timeout: self.upstream_timeout(),
            max_header_size: self.max_header_size,
            chunk_size: self.io_chunk_size,
            max_entry_size: self.cache_max_entry_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_connections > 0,
            "max_connections must be at least 1 (got {})",
            self.max_connections
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.io_chunk_size > 0,
            "io_chunk_size must be greater than 0 (got {})",
            self.io_chunk_size
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        if self.cache_enabled {
            ensure!(
                self.cache_max_entry_size > 0,
                "cache_max_entry_size must be greater than 0 (got {})",
                self.cache_max_entry_size
            );
            ensure!(
                self.cache_total_capacity > 0,
                "cache_total_capacity must be greater than 0 (got {})",
                self.cache_total_capacity
            );
            ensure!(
                self.cache_evict_percent <= 100,
                "cache_evict_percent must be between 0 and 100 (got {})",
                self.cache_evict_percent
            );
            ensure!(
                self.cache_sweeper_interval > 0,
                "cache_sweeper_interval must be greater than 0 seconds (got {})",
                self.cache_sweeper_interval
            );
        }
        if let Some(metrics) = self.metrics_listen
            && metrics == self.listen
        {
            bail!("metrics_listen must differ from listen ({metrics})");
        }
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/fanout-proxy/fanout-proxy.toml"),
        PathBuf::from("fanout-proxy.toml"),
    ]
}
