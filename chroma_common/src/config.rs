//! Configuration loading traits and types.
//!
//! All chroma applications load a single TOML file describing the device
//! geometry (pins, valve mappings, pump calibration), the command link,
//! the HTTP front-end and the persistence paths. Defaults reproduce the
//! shipped hardware wiring, so a missing section still yields a working
//! controller.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{
    DEFAULT_DATA_DIR, DEFAULT_VOLUME_PER_STEP_UL, LINK_BAUD_RATE, NUM_VALVE_PORTS,
};

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the specified path.
    #[error("configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Logging verbosity level, lowercase in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Common fields shared by every chroma binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Device instance identifier, used in log output.
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

fn default_device_name() -> String {
    "chroma".to_string()
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            device_name: default_device_name(),
        }
    }
}

/// Peristaltic pump geometry and calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpConfig {
    /// Driver enable pin (active low).
    pub enable_pin: u8,
    /// Direction pin.
    pub direction_pin: u8,
    /// Step pulse pin.
    pub step_pin: u8,
    /// Control tick period [s] used by the speed ramp.
    pub dt: f32,
    /// Invert the direction pin polarity.
    pub invert_direction: bool,
    /// Delivered volume per full motor step [µL].
    pub volume_per_step_ul: f32,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            enable_pin: 25,
            direction_pin: 32,
            step_pin: 33,
            dt: 0.01,
            invert_direction: true,
            volume_per_step_ul: DEFAULT_VOLUME_PER_STEP_UL,
        }
    }
}

impl PumpConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.dt > 0.0) {
            return Err(ConfigError::ValidationError(
                "pump.dt must be positive".to_string(),
            ));
        }
        if !(self.volume_per_step_ul > 0.0) {
            return Err(ConfigError::ValidationError(
                "pump.volume_per_step_ul must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Radial selector valve geometry.
///
/// `position_mapping` translates logical port numbers (what the operator
/// sees) into physical position indices, so port wiring may differ from
/// logical numbering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValveConfig {
    /// Driver enable pin (active low).
    pub enable_pin: u8,
    /// Direction pin.
    pub direction_pin: u8,
    /// Step pulse pin.
    pub step_pin: u8,
    /// Limit switch input pin, asserted high at the home position.
    pub limit_switch_pin: u8,
    /// Full motor steps per valve revolution (micro-stepping included).
    pub steps_per_revolution: u16,
    /// Invert the direction pin polarity.
    pub invert_direction: bool,
    /// Raw position corresponding to physical index 0 after homing.
    pub home_offset: u16,
    /// Logical port → physical position index.
    pub position_mapping: [u8; NUM_VALVE_PORTS as usize],
}

impl ValveConfig {
    /// Shipped wiring of the reagent (inlet) valve.
    pub fn reagent_default() -> Self {
        Self {
            enable_pin: 14,
            direction_pin: 26,
            step_pin: 27,
            limit_switch_pin: 15,
            steps_per_revolution: 200 * 8,
            invert_direction: true,
            home_offset: 365,
            position_mapping: [0, 5, 4, 3, 2, 1],
        }
    }

    /// Shipped wiring of the column (outlet) valve.
    pub fn column_default() -> Self {
        Self {
            enable_pin: 4,
            direction_pin: 17,
            step_pin: 16,
            limit_switch_pin: 2,
            steps_per_revolution: 200 * 8,
            invert_direction: true,
            home_offset: 365,
            position_mapping: [3, 2, 1, 0, 5, 4],
        }
    }

    pub fn validate(&self, which: &str) -> Result<(), ConfigError> {
        let ports = NUM_VALVE_PORTS as u16;
        if self.steps_per_revolution == 0 || self.steps_per_revolution % ports != 0 {
            return Err(ConfigError::ValidationError(format!(
                "{which}.steps_per_revolution must be a positive multiple of {ports}"
            )));
        }
        if self.home_offset >= self.steps_per_revolution {
            return Err(ConfigError::ValidationError(format!(
                "{which}.home_offset must be below steps_per_revolution"
            )));
        }
        let mut seen = [false; NUM_VALVE_PORTS as usize];
        for &idx in &self.position_mapping {
            if idx >= NUM_VALVE_PORTS {
                return Err(ConfigError::ValidationError(format!(
                    "{which}.position_mapping entries must be below {NUM_VALVE_PORTS}"
                )));
            }
            if seen[idx as usize] {
                return Err(ConfigError::ValidationError(format!(
                    "{which}.position_mapping entries must be distinct"
                )));
            }
            seen[idx as usize] = true;
        }
        Ok(())
    }
}

/// Framed serial command link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Serial device path; `None` disables the link task.
    pub serial_device: Option<String>,
    /// Line rate [bps].
    pub baud_rate: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            serial_device: None,
            baud_rate: LINK_BAUD_RATE,
        }
    }
}

/// HTTP front-end settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Socket address the axum server binds to.
    pub bind_addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Persistence locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the program and name-table files.
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: DEFAULT_DATA_DIR.to_string(),
        }
    }
}

/// Complete controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChromaConfig {
    pub shared: SharedConfig,
    pub pump: PumpConfig,
    pub reagent_valve: ValveConfig,
    pub column_valve: ValveConfig,
    pub link: LinkConfig,
    pub http: HttpConfig,
    pub storage: StorageConfig,
}

impl Default for ChromaConfig {
    fn default() -> Self {
        Self {
            shared: SharedConfig::default(),
            pump: PumpConfig::default(),
            reagent_valve: ValveConfig::reagent_default(),
            column_valve: ValveConfig::column_default(),
            link: LinkConfig::default(),
            http: HttpConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl ChromaConfig {
    /// Validate the full configuration bundle.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pump.validate()?;
        self.reagent_valve.validate("reagent_valve")?;
        self.column_valve.validate("column_valve")?;
        if self.http.bind_addr.is_empty() {
            return Err(ConfigError::ValidationError(
                "http.bind_addr cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl ConfigLoader for ChromaConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ChromaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pump.enable_pin, 25);
        assert_eq!(config.reagent_valve.position_mapping, [0, 5, 4, 3, 2, 1]);
        assert_eq!(config.column_valve.position_mapping, [3, 2, 1, 0, 5, 4]);
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config: ChromaConfig = toml::from_str("").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.link.baud_rate, LINK_BAUD_RATE);
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let config: ChromaConfig = toml::from_str(
            r#"
            [shared]
            log_level = "debug"
            device_name = "bench-rig"

            [pump]
            enable_pin = 1
            direction_pin = 2
            step_pin = 3
            dt = 0.01
            invert_direction = false
            volume_per_step_ul = 0.08
            "#,
        )
        .unwrap();
        assert_eq!(config.shared.log_level, LogLevel::Debug);
        assert_eq!(config.shared.device_name, "bench-rig");
        assert_eq!(config.pump.step_pin, 3);
        // Untouched sections keep their defaults.
        assert_eq!(config.reagent_valve.home_offset, 365);
    }

    #[test]
    fn rejects_bad_mapping() {
        let mut config = ChromaConfig::default();
        config.reagent_valve.position_mapping = [0, 0, 1, 2, 3, 4];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        config.reagent_valve.position_mapping = [0, 1, 2, 3, 4, 7];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_pump_dt() {
        let mut config = ChromaConfig::default();
        config.pump.dt = 0.0;
        assert!(config.validate().is_err());
        config.pump.dt = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_home_offset_out_of_range() {
        let mut config = ChromaConfig::default();
        config.column_valve.home_offset = config.column_valve.steps_per_revolution;
        assert!(config.validate().is_err());
    }
}
