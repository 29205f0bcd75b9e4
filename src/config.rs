//! Konfiguration des Remappers
//!
//! Gelesen wird `config.toml` aus `--config` oder aus
//! `<config_dir>/padremap/config.toml`. Fehlt die Datei, gelten die Defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::motion::MotionSettings;

const APP_DIR: &str = "padremap";
const CONFIG_FILE: &str = "config.toml";
const PROFILES_DIR: &str = "profiles";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Konfiguration konnte nicht gelesen werden ({path}): {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Konfiguration ist fehlerhaft: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Ungültiger Wert für {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Zeitverhalten der Worker und des Scanners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_interval_ms: u64,
    pub read_timeout_ms: u64,
    pub scan_interval_ms: u64,
    /// Kapazität des Event-Kanals
    pub event_buffer: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 20,
            read_timeout_ms: 500,
            scan_interval_ms: 1000,
            event_buffer: 64,
        }
    }
}

impl SchedulerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub enabled: bool,
    pub baud_rate: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            baud_rate: 57600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSettings {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:1234".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HidSettings {
    pub enabled: bool,
}

impl Default for HidSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Profil, das beim Anschließen eines Geräts automatisch geladen wird
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub device: String,
    /// Relativ zu `profiles_dir`
    pub profile: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemapperConfig {
    pub scheduler: SchedulerSettings,
    pub motion: MotionSettings,
    pub serial: SerialSettings,
    pub tcp: TcpSettings,
    pub hid: HidSettings,
    pub profiles_dir: PathBuf,
    #[serde(rename = "binding")]
    pub bindings: Vec<Binding>,
}

impl Default for RemapperConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSettings::default(),
            motion: MotionSettings::default(),
            serial: SerialSettings::default(),
            tcp: TcpSettings::default(),
            hid: HidSettings::default(),
            profiles_dir: app_dir().join(PROFILES_DIR),
            bindings: Vec::new(),
        }
    }
}

fn app_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Standardpfad der Konfigurationsdatei
pub fn default_config_path() -> PathBuf {
    app_dir().join(CONFIG_FILE)
}

impl RemapperConfig {
    /// Lädt die Konfiguration. Eine fehlende Datei ergibt die Defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);

        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
        if !exists {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        debug!("Config: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.tick_interval_ms",
                reason: "muss größer als 0 sein".to_string(),
            });
        }
        if self.scheduler.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.read_timeout_ms",
                reason: "muss größer als 0 sein".to_string(),
            });
        }
        if self.scheduler.scan_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.scan_interval_ms",
                reason: "muss größer als 0 sein".to_string(),
            });
        }
        if self.scheduler.event_buffer == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.event_buffer",
                reason: "muss größer als 0 sein".to_string(),
            });
        }
        if self.motion.bias_window == 0 {
            return Err(ConfigError::Invalid {
                field: "motion.bias_window",
                reason: "muss größer als 0 sein".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.motion.accel_correction) {
            return Err(ConfigError::Invalid {
                field: "motion.accel_correction",
                reason: format!("{} liegt nicht in [0,1]", self.motion.accel_correction),
            });
        }
        Ok(())
    }

    /// Profilpfad für ein Gerät laut `[[binding]]`, aufgelöst gegen `profiles_dir`
    pub fn binding_for(&self, device_id: &str) -> Option<PathBuf> {
        self.bindings
            .iter()
            .find(|b| b.device == device_id)
            .map(|b| self.profiles_dir.join(&b.profile))
    }
}
