//! Application configuration
//!
//! One TOML file, read from `$EXCAVLINK_CONFIG` or
//! `~/.config/excavlink/config.toml`. A missing file is replaced by the
//! defaults, written back so they can be edited.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::controller::NormalizerSettings;
use crate::mqtt::BusConfig;
use crate::publisher::PublisherSettings;
use crate::session::{SessionSettings, SignalingConfig};
use crate::status::MachineTelemetry;

pub const CONFIG_ENV: &str = "EXCAVLINK_CONFIG";
const CONFIG_DIR: &str = ".config/excavlink";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which half of the link this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunRole {
    #[default]
    Operator,
    Machine,
    /// Operator and machine in one process over the in-process hub
    Loopback,
}

impl fmt::Display for RunRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunRole::Operator => write!(f, "operator"),
            RunRole::Machine => write!(f, "machine"),
            RunRole::Loopback => write!(f, "loopback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub role: RunRole,
    pub machine_id: String,
    pub signaling: SignalingConfig,
    pub bus: BusConfig,
    pub publisher: PublisherSettings,
    pub input: NormalizerSettings,
    pub session: SessionSettings,
    /// Static values the machine reports until real sensors are wired in
    pub telemetry: MachineTelemetry,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            role: RunRole::default(),
            machine_id: "1".to_string(),
            signaling: SignalingConfig::default(),
            bus: BusConfig::default(),
            publisher: PublisherSettings::default(),
            input: NormalizerSettings::default(),
            session: SessionSettings::default(),
            telemetry: MachineTelemetry {
                fuel_level: 100.0,
                battery_level: 100.0,
                hydraulic_pressure: 0.0,
                working_hours: 0.0,
                status: "ready".to_string(),
            },
        }
    }
}

impl AppConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: AppConfig = toml::from_str(content)?;
        config.publisher.topic = config.bus.topic.clone();
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publisher.period_ms == 0 {
            return Err(ConfigError::Invalid(
                "publisher.period_ms must be positive".to_string(),
            ));
        }
        if self.input.sample_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "input.sample_interval_ms must be positive".to_string(),
            ));
        }
        if self.session.telemetry_interval_ms == 0 || self.session.media_retry_ms == 0 {
            return Err(ConfigError::Invalid(
                "session intervals must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.input.deadzone) {
            return Err(ConfigError::Invalid(format!(
                "input.deadzone {} outside [0, 1)",
                self.input.deadzone
            )));
        }
        if !self.input.track.is_ordered() {
            let t = &self.input.track;
            return Err(ConfigError::Invalid(format!(
                "track calibration must satisfy forward < backward < still (got {} / {} / {})",
                t.forward, t.backward, t.still
            )));
        }
        if self.bus.topic.is_empty() {
            return Err(ConfigError::Invalid("bus.topic must not be empty".to_string()));
        }
        Ok(())
    }

    /// Reads `path`, writing the defaults there first if it does not exist
    pub async fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| io_error(path, source))?;

        if !exists {
            warn!(
                "Config file {} does not exist, writing defaults",
                path.display()
            );
            let config = AppConfig::default();
            config.save(path).await?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| io_error(path, source))?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| io_error(parent, source))?;
        }
        let content = self.to_toml_string()?;
        tokio::fs::write(path, content)
            .await
            .map_err(|source| io_error(path, source))?;
        debug!("Config written to {}", path.display());
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// `$EXCAVLINK_CONFIG` if set, else the file under the home directory
pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    let mut path = get_home_dir();
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::TrackCalibration;

    #[tokio::test]
    async fn missing_file_is_replaced_by_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = AppConfig::load_or_default(&path).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());

        let reloaded = AppConfig::load_or_default(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn partial_file_keeps_defaults_and_copies_topic() {
        let config = AppConfig::from_toml_str(
            r#"
role = "machine"
machine_id = "7"

[bus]
url = "memory://"
topic = "/excav7_joint_command"

[publisher]
period_ms = 50
"#,
        )
        .unwrap();

        assert_eq!(config.role, RunRole::Machine);
        assert_eq!(config.machine_id, "7");
        assert_eq!(config.publisher.period_ms, 50);
        assert_eq!(config.publisher.topic, "/excav7_joint_command");
        assert_eq!(config.session, SessionSettings::default());
        assert_eq!(config.input.deadzone, 0.1);
    }

    #[test]
    fn zero_period_is_rejected() {
        let result = AppConfig::from_toml_str("[publisher]\nperiod_ms = 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn deadzone_must_be_below_one() {
        let mut config = AppConfig::default();
        config.input.deadzone = 1.0;
        assert!(config.validate().is_err());
        config.input.deadzone = -0.1;
        assert!(config.validate().is_err());
        config.input.deadzone = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unordered_track_calibration_is_rejected() {
        let mut config = AppConfig::default();
        config.input.track = TrackCalibration {
            forward: 0.5,
            still: 1.286,
            backward: 0.143,
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            AppConfig::from_toml_str("role = [unclosed"),
            Err(ConfigError::Parse(_))
        ));
    }
}
