use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_workers() -> usize {
    4
}

fn default_read_chunk_size() -> usize {
    16 * 1024
}

fn default_max_request_header_size() -> usize {
    32 * 1024
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_io_timeout() -> u64 {
    10
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub listen: SocketAddr,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default = "default_max_request_header_size")]
    pub max_request_header_size: usize,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_io_timeout")]
    pub upstream_io_timeout: u64,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = resolve_config_path(cli)?;
        Self::load_from(&config_path)
    }

    /// Load settings from an explicit file, layering `FANOUT__*` environment
    /// overrides on top.
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::from(config_path.to_path_buf()).required(true))
            .add_source(
                Environment::with_prefix("FANOUT")
                    .separator("__")
                    .try_parsing(true),
            );

        let cfg = builder.build().map_err(to_anyhow)?;
        let settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults for everything except the listen address.
    pub fn with_listen(listen: SocketAddr) -> Self {
        Self {
            listen,
            workers: default_workers(),
            log: default_log_format(),
            read_chunk_size: default_read_chunk_size(),
            max_request_header_size: default_max_request_header_size(),
            upstream_connect_timeout: default_upstream_connect_timeout(),
            upstream_io_timeout: default_upstream_io_timeout(),
            metrics_listen: None,
        }
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_io_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_io_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.workers > 0,
            "workers must be at least 1 (got {})",
            self.workers
        );
        ensure!(
            self.read_chunk_size > 0,
            "read_chunk_size must be greater than 0 (got {})",
            self.read_chunk_size
        );
        ensure!(
            self.max_request_header_size > 0,
            "max_request_header_size must be greater than 0 (got {})",
            self.max_request_header_size
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.upstream_io_timeout > 0,
            "upstream_io_timeout must be greater than 0 seconds (got {})",
            self.upstream_io_timeout
        );
        if let Some(metrics) = self.metrics_listen {
            ensure!(
                metrics != self.listen || metrics.port() == 0,
                "metrics_listen must differ from listen ({metrics})"
            );
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
