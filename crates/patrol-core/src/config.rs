//! Daemon configuration.
//!
//! Loaded from a TOML file when present, otherwise defaulted. Command-line
//! flags in the daemon override individual fields.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default base of the 13-register EMI window.
pub const DEFAULT_EMI_BASE: u16 = 0x220;

/// Default bezel poll cadence in milliseconds.
pub const DEFAULT_BEZEL_POLL_MS: u64 = 50;

/// Default timeout for EC calls issued by request handlers.
pub const DEFAULT_EC_TIMEOUT_MS: u64 = 5000;

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path that was attempted.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file could not be parsed.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Path that was attempted.
        path: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PatrolConfig {
    /// Path of the control endpoint socket.
    pub control_socket: PathBuf,

    /// Path of the monitor endpoint socket.
    pub monitor_socket: PathBuf,

    /// Path of the provisioned shared secret.
    pub secret_file: PathBuf,

    /// Base I/O port of the EMI register window.
    pub emi_base: u16,

    /// Bezel poll cadence in milliseconds.
    pub bezel_poll_ms: u64,

    /// Default timeout for handler-issued EC calls, in milliseconds.
    pub ec_timeout_ms: u64,

    /// Directory the daemon writes its log files under.
    pub log_dir: PathBuf,

    /// Maximum size of one log file before it rolls, in bytes.
    pub log_max_size: u64,

    /// Number of rolled log files kept.
    pub log_max_files: u32,

    /// Sessions idle longer than this many seconds lose their
    /// authentication on the next sweep. Zero disables the sweep.
    pub session_idle_secs: u64,

    /// When true, failure to open the raw port device is fatal at startup.
    /// When false the daemon runs without the EC subsystem and EC requests
    /// report the controller unavailable.
    pub require_hardware: bool,
}

impl Default for PatrolConfig {
    fn default() -> Self {
        Self {
            control_socket: PathBuf::from("/run/patrol/patrol-control.sock"),
            monitor_socket: PathBuf::from("/run/patrol/patrol-monitor.sock"),
            secret_file: PathBuf::from("/etc/patrol/secret"),
            emi_base: DEFAULT_EMI_BASE,
            bezel_poll_ms: DEFAULT_BEZEL_POLL_MS,
            ec_timeout_ms: DEFAULT_EC_TIMEOUT_MS,
            log_dir: PathBuf::from("/var/log/patrol"),
            log_max_size: 5 * 1024 * 1024,
            log_max_files: 5,
            session_idle_secs: 600,
            require_hardware: false,
        }
    }
}

impl PatrolConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = PatrolConfig::default();
        assert_eq!(config.emi_base, 0x220);
        assert_eq!(config.bezel_poll_ms, 50);
        assert_eq!(config.ec_timeout_ms, 5000);
        assert_eq!(config.log_max_files, 5);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patrol.toml");
        std::fs::write(&path, "emi_base = 0x240\nrequire_hardware = true\n").unwrap();

        let config = PatrolConfig::from_file(&path).unwrap();
        assert_eq!(config.emi_base, 0x240);
        assert!(config.require_hardware);
        assert_eq!(config.bezel_poll_ms, DEFAULT_BEZEL_POLL_MS);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patrol.toml");
        std::fs::write(&path, "emi_bsae = 0x240\n").unwrap();

        assert!(matches!(
            PatrolConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
