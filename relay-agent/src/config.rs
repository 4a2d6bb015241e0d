use std::path::{Path, PathBuf};
use std::{env, fs};

use relay_core::RelayConfig;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error while accessing `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Full agent configuration, loaded from TOML.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Relay core settings `[relay]`
    pub relay: RelayConfig,
    /// Monitoring settings `[monitor]`
    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// Settings for the periodic metric log `[monitor]`.
#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Seconds between metric snapshot log lines
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
    /// Whether to log cumulative relay totals alongside each snapshot
    #[serde(default = "default_log_totals")]
    pub log_totals: bool,
}

fn default_snapshot_interval() -> u64 {
    5
}

fn default_log_totals() -> bool {
    true
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: default_snapshot_interval(),
            log_totals: default_log_totals(),
        }
    }
}

impl Config {
    /// Load, parse, and validate a `Config` from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let cfg: Config = toml::from_str(&s).map_err(ConfigError::Parse)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.relay
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        if self.monitor.snapshot_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "monitor.snapshot_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn from_str(toml: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(toml).map_err(ConfigError::Parse)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Find the `config.toml` path by checking an override environment variable
/// first and falling back to a file next to the running executable.
///
/// This function never fails; it returns a path even if the file is missing
/// so the caller can surface a clean configuration error.
pub fn find_config_file() -> PathBuf {
    if let Some(cfg) = env::var_os("RELAY_CONFIG") {
        return PathBuf::from(cfg);
    }

    let mut exe_path = env::current_exe().unwrap_or_else(|_| PathBuf::from("."));
    exe_path.pop();
    exe_path.push("config.toml");
    exe_path
}
