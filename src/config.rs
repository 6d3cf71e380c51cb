use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub channels: ChannelConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerialConfig {
    pub port: Option<String>,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_read_timeout")]
    pub read_timeout: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud: default_baud(),
            read_timeout: default_read_timeout(),
        }
    }
}

fn default_baud() -> u32 {
    115_200
}

fn default_read_timeout() -> String {
    "1s".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_file: default_data_file(),
        }
    }
}

/// `tide_sensor_data.csv` under the platform data directory, falling back to
/// the working directory when there is none.
fn default_data_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tide-ingest")
        .join("tide_sensor_data.csv")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

fn default_capacity() -> usize {
    20_000
}

/// Queue depths of the frame and event channels. Snapshots need no depth:
/// consumers only ever see the latest one.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    #[serde(default = "default_frames_depth")]
    pub frames: usize,
    #[serde(default = "default_events_depth")]
    pub events: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            frames: default_frames_depth(),
            events: default_events_depth(),
        }
    }
}

fn default_frames_depth() -> usize {
    256
}

fn default_events_depth() -> usize {
    32
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    pub fn from_str(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not an empty mapping.
        let config: Config = if yaml.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.baud == 0 {
            return Err(ConfigError::Invalid("serial.baud must be > 0".into()));
        }
        self.read_timeout()?;
        if self.window.capacity == 0 {
            return Err(ConfigError::Invalid("window.capacity must be > 0".into()));
        }
        let depths = [
            ("channels.frames", self.channels.frames),
            ("channels.events", self.channels.events),
        ];
        if let Some((name, _)) = depths.iter().find(|(_, depth)| *depth == 0) {
            return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Result<Duration, ConfigError> {
        humantime::parse_duration(self.serial.read_timeout.trim()).map_err(|e| {
            ConfigError::Invalid(format!(
                "serial.read_timeout '{}': {}",
                self.serial.read_timeout, e
            ))
        })
    }
}
