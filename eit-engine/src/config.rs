//! Engine configuration.
//!
//! The TOML file mirrors the resolved [`EngineConfig`] but every field is
//! optional; missing values fall back to the defaults below and the command
//! line overrides both.
//!
//! ```toml
//! [epg]
//! languages = ["deu", "eng"]
//! linger_secs = 10800
//! update_channels = 5
//! auto_create_channels = true
//! lock_timeout_ms = 10
//!
//! [time]
//! set_system_time = false
//! source = 1
//! transponder = 11836
//!
//! [logging]
//! log_dir = "logs"
//! retention_days = 7
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub epg: EpgSection,
    #[serde(default)]
    pub time: TimeSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize, Default)]
pub struct EpgSection {
    pub languages: Option<Vec<String>>,
    pub linger_secs: Option<i64>,
    pub update_channels: Option<u8>,
    pub auto_create_channels: Option<bool>,
    pub lock_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct TimeSection {
    pub set_system_time: Option<bool>,
    pub source: Option<u32>,
    pub transponder: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

/// Read and parse a configuration file.
pub fn load_config(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}

/// EPG reconciliation settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpgConfig {
    /// Preferred languages, best first.
    pub languages: Vec<String>,
    /// Seconds an ended event is kept.
    pub linger_secs: i64,
    /// 0..=5. 1 or >= 3 renames linked channels, >= 4 also creates them.
    pub update_channels: u8,
    /// Create unknown channels on first sight.
    pub auto_create_channels: bool,
    /// Store write lock timeout in milliseconds.
    pub lock_timeout_ms: u64,
}

impl Default for EpgConfig {
    fn default() -> Self {
        Self {
            languages: Vec::new(),
            linger_secs: 3 * 3600,
            update_channels: 5,
            auto_create_channels: true,
            lock_timeout_ms: 10,
        }
    }
}

impl EpgConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// System clock synchronisation settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimeConfig {
    pub set_system_time: bool,
    /// Source whose TDT is trusted.
    pub source: u32,
    /// Transponder frequency in MHz whose TDT is trusted, 0 for none.
    pub transponder: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub retention_days: u64,
    pub level: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            retention_days: 7,
            level: None,
        }
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineConfig {
    pub epg: EpgConfig,
    pub time: TimeConfig,
    pub logging: LoggingConfig,
}

impl ConfigFile {
    /// Fill in defaults and validate.
    pub fn resolve(self) -> Result<EngineConfig, ConfigError> {
        let defaults = EngineConfig::default();

        let update_channels = self.epg.update_channels.unwrap_or(defaults.epg.update_channels);
        if update_channels > 5 {
            return Err(ConfigError::Invalid {
                key: "epg.update_channels",
                reason: format!("{} is not in 0..=5", update_channels),
            });
        }
        let linger_secs = self.epg.linger_secs.unwrap_or(defaults.epg.linger_secs);
        if linger_secs < 0 {
            return Err(ConfigError::Invalid {
                key: "epg.linger_secs",
                reason: "must not be negative".to_string(),
            });
        }

        Ok(EngineConfig {
            epg: EpgConfig {
                languages: self.epg.languages.unwrap_or(defaults.epg.languages),
                linger_secs,
                update_channels,
                auto_create_channels: self
                    .epg
                    .auto_create_channels
                    .unwrap_or(defaults.epg.auto_create_channels),
                lock_timeout_ms: self.epg.lock_timeout_ms.unwrap_or(defaults.epg.lock_timeout_ms),
            },
            time: TimeConfig {
                set_system_time: self.time.set_system_time.unwrap_or(false),
                source: self.time.source.unwrap_or(0),
                transponder: self.time.transponder.unwrap_or(0),
            },
            logging: LoggingConfig {
                log_dir: self
                    .logging
                    .log_dir
                    .map(PathBuf::from)
                    .unwrap_or(defaults.logging.log_dir),
                retention_days: self
                    .logging
                    .retention_days
                    .unwrap_or(defaults.logging.retention_days),
                level: self.logging.level,
            },
        })
    }
}
