// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Daemon configuration: defaults, then an optional TOML file, then CLI
//! flags and environment variables.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Address the service listens on and clients connect to by default.
pub const DEFAULT_SERVICE_ADDR: &str = "127.0.0.1:50051";
/// Environment variable overriding [`DEFAULT_SERVICE_ADDR`].
pub const SERVICE_ADDR_ENV: &str = "ACCELRT_SERVICE_ADDR";
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_LIVENESS_WINDOW_MS: u64 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    /// How often the reaper scans the liveness table.
    pub keepalive_interval_ms: u64,
    /// Silence after which a client is considered gone.
    pub liveness_window_ms: u64,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            liveness_window_ms: DEFAULT_LIVENESS_WINDOW_MS,
            log: "info".to_string(),
        }
    }
}

/// Command line of the `accelrt-service` daemon.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "accelrt-service")]
#[command(about = "Shares configured accelerator core-ops with other processes")]
pub struct ServiceArgs {
    /// TOML file with service settings
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Address for the gRPC server
    #[arg(long, env = SERVICE_ADDR_ENV)]
    pub listen_addr: Option<SocketAddr>,

    /// Interval between liveness scans, in milliseconds
    #[arg(long, env = "ACCELRT_KEEPALIVE_INTERVAL_MS")]
    pub keepalive_interval_ms: Option<u64>,

    /// Keep-alive silence after which a client is reaped, in milliseconds
    #[arg(long, env = "ACCELRT_LIVENESS_WINDOW_MS")]
    pub liveness_window_ms: Option<u64>,

    /// Default log filter (overridden by RUST_LOG)
    #[arg(long)]
    pub log: Option<String>,
}

impl ServiceConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Layer `args` over the config file they name (if any) over defaults.
    pub fn resolve(args: &ServiceArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(addr) = args.listen_addr {
            config.listen_addr = addr;
        }
        if let Some(interval) = args.keepalive_interval_ms {
            config.keepalive_interval_ms = interval;
        }
        if let Some(window) = args.liveness_window_ms {
            config.liveness_window_ms = window;
        }
        if let Some(log) = &args.log {
            config.log = log.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "keepalive_interval_ms must be positive".into(),
            ));
        }
        if self.liveness_window_ms <= self.keepalive_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "liveness_window_ms ({}) must exceed keepalive_interval_ms ({})",
                self.liveness_window_ms, self.keepalive_interval_ms
            )));
        }
        Ok(())
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.listen_addr.to_string(), DEFAULT_SERVICE_ADDR);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ServiceConfig::from_toml_str("liveness_window_ms = 30000\n").unwrap();
        assert_eq!(config.liveness_window_ms, 30_000);
        assert_eq!(config.keepalive_interval_ms, DEFAULT_KEEPALIVE_INTERVAL_MS);
        assert!(matches!(
            ServiceConfig::from_toml_str("listen_addr = 5"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    #[serial]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen_addr = \"0.0.0.0:6000\"").unwrap();
        writeln!(file, "keepalive_interval_ms = 500").unwrap();
        writeln!(file, "liveness_window_ms = 4000").unwrap();

        let path = file.path().to_string_lossy().into_owned();
        let args = ServiceArgs::try_parse_from([
            "accelrt-service",
            "--config",
            &path,
            "--liveness-window-ms",
            "9000",
        ])
        .unwrap();
        let config = ServiceConfig::resolve(&args).unwrap();
        assert_eq!(config.listen_addr.to_string(), "0.0.0.0:6000");
        assert_eq!(config.keepalive_interval(), Duration::from_millis(500));
        assert_eq!(config.liveness_window(), Duration::from_millis(9000));
    }

    #[test]
    #[serial]
    fn test_env_sets_listen_addr() {
        // SAFETY: serialized with every other test touching the environment.
        unsafe { std::env::set_var(SERVICE_ADDR_ENV, "127.0.0.1:7100") };
        let args = ServiceArgs::try_parse_from(["accelrt-service"]);
        unsafe { std::env::remove_var(SERVICE_ADDR_ENV) };

        let config = ServiceConfig::resolve(&args.unwrap()).unwrap();
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:7100");
    }

    #[test]
    fn test_window_must_exceed_interval() {
        let args = ServiceArgs {
            keepalive_interval_ms: Some(1000),
            liveness_window_ms: Some(1000),
            ..Default::default()
        };
        assert!(matches!(
            ServiceConfig::resolve(&args),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let args = ServiceArgs {
            config: Some(PathBuf::from("/nonexistent/accelrt-service.toml")),
            ..Default::default()
        };
        assert!(matches!(
            ServiceConfig::resolve(&args),
            Err(ConfigError::Read { .. })
        ));
    }
}
