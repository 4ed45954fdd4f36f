//! Rig configuration loading and validation.
//!
//! One TOML file describes a complete rig: pin wiring, drive channels,
//! sensor ranges, actuator bounds and the platform geometry. The
//! defaults match the six-actuator demonstrator.
//!
//! # TOML Example
//!
//! ```toml
//! [pins]
//! direction = [22, 5, 6, 13, 19, 26]
//!
//! [servo]
//! channels = [0, 1, 2, 3, 4, 5]
//! maximal_speed = 1.0
//!
//! [extension]
//! channels = [0, 1, 2, 3, 4, 5]
//! samples_per_measurement = 3
//! correction_file = "corrections.toml"
//!
//! [actuators]
//! minimal_extension = 0.1
//! maximal_extension = 0.8
//!
//! [geometry]
//! base_joints = [[0.3, 0.0, 0.0], [0.15, 0.2598, 0.0], [-0.15, 0.2598, 0.0], [-0.3, 0.0, 0.0], [-0.15, -0.2598, 0.0], [0.15, -0.2598, 0.0]]
//! effector_joints = [[0.15, 0.0, 0.0], [0.075, 0.1299, 0.0], [-0.075, 0.1299, 0.0], [-0.15, 0.0, 0.0], [-0.075, -0.1299, 0.0], [0.075, -0.1299, 0.0]]
//! minimal_allowed_extension = [0.2, 0.2, 0.2, 0.2, 0.2, 0.2]
//! maximal_allowed_extension = [0.8, 0.8, 0.8, 0.8, 0.8, 0.8]
//! ```

use std::path::Path;

use glam::DVec3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gpio::{FIRST_PIN, LAST_PIN};
use crate::platform::{ACTUATOR_COUNT, PlatformGeometry};
use crate::sensors::Correction;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
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

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

/// Direction pin wiring, one pin per actuator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinConfig {
    pub direction: Vec<u8>,
}

/// Drive stage wiring and speed cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServoConfig {
    /// PWM channel per actuator.
    pub channels: Vec<u8>,

    /// Cap applied to every commanded speed, in `(0, 1]`.
    #[serde(default = "default_maximal_speed")]
    pub maximal_speed: f64,
}

/// Extension sensor wiring and pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionSensorConfig {
    /// Converter channel per actuator.
    pub channels: Vec<u8>,

    /// Lower end of the measurable range.
    #[serde(default = "default_extension_minimal")]
    pub minimal: f64,

    /// Upper end of the measurable range.
    #[serde(default = "default_extension_maximal")]
    pub maximal: f64,

    /// Raw readings aggregated into one measurement.
    #[serde(default = "default_samples_per_measurement")]
    pub samples_per_measurement: usize,

    /// Optional correction table file, relative to the working directory.
    #[serde(default)]
    pub correction_file: Option<String>,
}

/// Closed-loop actuator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorConfig {
    /// Lowest commandable extension.
    pub minimal_extension: f64,

    /// Highest commandable extension.
    pub maximal_extension: f64,

    /// Half-width of the band that counts as reached.
    #[serde(default = "default_acceptable_deviation")]
    pub acceptable_deviation: f64,
}

/// Mechanical layout, six joints per plate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryConfig {
    pub base_joints: Vec<DVec3>,
    pub effector_joints: Vec<DVec3>,
    pub minimal_allowed_extension: Vec<f64>,
    pub maximal_allowed_extension: Vec<f64>,
}

/// Complete description of one rig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigConfig {
    pub pins: PinConfig,
    pub servo: ServoConfig,
    pub extension: ExtensionSensorConfig,
    pub actuators: ActuatorConfig,
    pub geometry: GeometryConfig,
}

fn default_maximal_speed() -> f64 {
    1.0
}

fn default_extension_minimal() -> f64 {
    0.0
}

fn default_extension_maximal() -> f64 {
    1.0
}

fn default_samples_per_measurement() -> usize {
    3
}

fn default_acceptable_deviation() -> f64 {
    0.01
}

impl RigConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if any list does not have
    /// one entry per actuator, a pin is unaddressable or listed twice,
    /// a range is empty or not finite, or a geometry band leaves the
    /// actuator bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pins.direction.len() != ACTUATOR_COUNT {
            return Err(ConfigError::ValidationError(format!(
                "expected {ACTUATOR_COUNT} direction pins, got {}",
                self.pins.direction.len()
            )));
        }
        for (index, &pin) in self.pins.direction.iter().enumerate() {
            if !(FIRST_PIN..=LAST_PIN).contains(&pin) {
                return Err(ConfigError::ValidationError(format!(
                    "direction pin {pin} outside the addressable range"
                )));
            }
            if self.pins.direction[..index].contains(&pin) {
                return Err(ConfigError::ValidationError(format!(
                    "direction pin {pin} listed twice"
                )));
            }
        }

        if self.servo.channels.len() != ACTUATOR_COUNT {
            return Err(ConfigError::ValidationError(format!(
                "expected {ACTUATOR_COUNT} servo channels, got {}",
                self.servo.channels.len()
            )));
        }
        if !self.servo.maximal_speed.is_finite()
            || self.servo.maximal_speed <= 0.0
            || self.servo.maximal_speed > 1.0
        {
            return Err(ConfigError::ValidationError(format!(
                "servo maximal_speed {} outside (0, 1]",
                self.servo.maximal_speed
            )));
        }

        if self.extension.channels.len() != ACTUATOR_COUNT {
            return Err(ConfigError::ValidationError(format!(
                "expected {ACTUATOR_COUNT} extension sensor channels, got {}",
                self.extension.channels.len()
            )));
        }
        if !self.extension.minimal.is_finite()
            || !self.extension.maximal.is_finite()
            || self.extension.minimal >= self.extension.maximal
        {
            return Err(ConfigError::ValidationError(format!(
                "extension sensor range [{}, {}] is empty",
                self.extension.minimal, self.extension.maximal
            )));
        }
        if self.extension.samples_per_measurement == 0 {
            return Err(ConfigError::ValidationError(
                "samples_per_measurement must be at least 1".to_string(),
            ));
        }

        if !self.actuators.minimal_extension.is_finite()
            || !self.actuators.maximal_extension.is_finite()
            || self.actuators.minimal_extension >= self.actuators.maximal_extension
        {
            return Err(ConfigError::ValidationError(format!(
                "actuator bounds [{}, {}] are empty",
                self.actuators.minimal_extension, self.actuators.maximal_extension
            )));
        }
        if !self.actuators.acceptable_deviation.is_finite()
            || self.actuators.acceptable_deviation <= 0.0
        {
            return Err(ConfigError::ValidationError(format!(
                "acceptable_deviation {} must be positive",
                self.actuators.acceptable_deviation
            )));
        }

        if self.geometry.base_joints.len() != ACTUATOR_COUNT
            || self.geometry.effector_joints.len() != ACTUATOR_COUNT
        {
            return Err(ConfigError::ValidationError(format!(
                "geometry needs {ACTUATOR_COUNT} base and {ACTUATOR_COUNT} effector joints"
            )));
        }
        for joint in self
            .geometry
            .base_joints
            .iter()
            .chain(&self.geometry.effector_joints)
        {
            if !joint.is_finite() {
                return Err(ConfigError::ValidationError(
                    "joint positions must be finite".to_string(),
                ));
            }
        }
        if self.geometry.minimal_allowed_extension.len() != ACTUATOR_COUNT
            || self.geometry.maximal_allowed_extension.len() != ACTUATOR_COUNT
        {
            return Err(ConfigError::ValidationError(format!(
                "geometry needs {ACTUATOR_COUNT} extension bands"
            )));
        }
        for (channel, (&minimal, &maximal)) in self
            .geometry
            .minimal_allowed_extension
            .iter()
            .zip(&self.geometry.maximal_allowed_extension)
            .enumerate()
        {
            if !minimal.is_finite() || !maximal.is_finite() || minimal < 0.0 || minimal >= maximal
            {
                return Err(ConfigError::ValidationError(format!(
                    "extension band [{minimal}, {maximal}] of channel {channel} is invalid"
                )));
            }
            if minimal < self.actuators.minimal_extension
                || maximal > self.actuators.maximal_extension
            {
                return Err(ConfigError::ValidationError(format!(
                    "extension band [{minimal}, {maximal}] of channel {channel} leaves the \
                     actuator bounds [{}, {}]",
                    self.actuators.minimal_extension, self.actuators.maximal_extension
                )));
            }
        }

        Ok(())
    }

    /// Convert the geometry section into its typed platform form.
    pub fn platform_geometry(&self) -> Result<PlatformGeometry, ConfigError> {
        self.validate()?;
        Ok(PlatformGeometry {
            base_joints: std::array::from_fn(|joint| self.geometry.base_joints[joint]),
            effector_joints: std::array::from_fn(|joint| self.geometry.effector_joints[joint]),
            minimal_allowed_extension: std::array::from_fn(|channel| {
                self.geometry.minimal_allowed_extension[channel]
            }),
            maximal_allowed_extension: std::array::from_fn(|channel| {
                self.geometry.maximal_allowed_extension[channel]
            }),
        })
    }
}

fn hexagon(radius: f64) -> Vec<DVec3> {
    (0..ACTUATOR_COUNT)
        .map(|joint| {
            let angle = (joint as f64) * 60.0_f64.to_radians();
            DVec3::new(radius * angle.cos(), radius * angle.sin(), 0.0)
        })
        .collect()
}

impl Default for RigConfig {
    /// Wiring and geometry of the demonstrator rig.
    fn default() -> Self {
        Self {
            pins: PinConfig {
                direction: vec![22, 5, 6, 13, 19, 26],
            },
            servo: ServoConfig {
                channels: vec![0, 1, 2, 3, 4, 5],
                maximal_speed: 1.0,
            },
            extension: ExtensionSensorConfig {
                channels: vec![0, 1, 2, 3, 4, 5],
                minimal: 0.0,
                maximal: 1.0,
                samples_per_measurement: 3,
                correction_file: None,
            },
            actuators: ActuatorConfig {
                minimal_extension: 0.1,
                maximal_extension: 0.8,
                acceptable_deviation: 0.01,
            },
            geometry: GeometryConfig {
                base_joints: hexagon(0.3),
                effector_joints: hexagon(0.15),
                minimal_allowed_extension: vec![0.2; ACTUATOR_COUNT],
                maximal_allowed_extension: vec![0.8; ACTUATOR_COUNT],
            },
        }
    }
}

// ─── Correction Tables ──────────────────────────────────────────────

/// Breakpoints of one sensor channel, `[raw, corrected]` pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionChannel {
    pub points: Vec<[f64; 2]>,
}

/// On-disk correction tables, one `[[channel]]` entry per sensor.
///
/// The breakpoints are validated by the sensors when the corrections are
/// installed, not at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionTableFile {
    pub channel: Vec<CorrectionChannel>,
}

impl CorrectionTableFile {
    pub fn from_tables(tables: Vec<Vec<[f64; 2]>>) -> Self {
        Self {
            channel: tables
                .into_iter()
                .map(|points| CorrectionChannel { points })
                .collect(),
        }
    }

    /// One table correction per channel entry.
    pub fn corrections(&self) -> Vec<Correction> {
        self.channel
            .iter()
            .map(|entry| Correction::Table(entry.points.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RigConfig::default();
        config.validate().unwrap();
        let geometry = config.platform_geometry().unwrap();
        geometry.validate().unwrap();
        assert!((geometry.base_joints[0].x - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_load_round_trip() {
        let config = RigConfig::default();
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", toml::to_string(&config).unwrap()).unwrap();
        file.flush().unwrap();

        let loaded = RigConfig::load(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_file_not_found() {
        let result = RigConfig::load(Path::new("/nonexistent/rig.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn test_load_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid toml {{{{").unwrap();
        file.flush().unwrap();

        let result = RigConfig::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_omitted_fields_take_defaults() {
        let mut config = RigConfig::default();
        config.extension.samples_per_measurement = 7;
        let mut rendered = toml::to_string(&config).unwrap();
        rendered = rendered.replace("samples_per_measurement = 7\n", "");

        let loaded: RigConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(loaded.extension.samples_per_measurement, 3);
    }

    #[test]
    fn test_validation_rejects_bad_wiring() {
        let mut config = RigConfig::default();
        config.pins.direction = vec![22, 5, 6, 13, 19];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = RigConfig::default();
        config.pins.direction = vec![22, 5, 6, 13, 19, 30];
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.pins.direction = vec![22, 5, 6, 13, 19, 22];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_ranges() {
        let mut config = RigConfig::default();
        config.extension.minimal = 1.0;
        config.extension.maximal = 1.0;
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.extension.samples_per_measurement = 0;
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.actuators.maximal_extension = 0.05;
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.servo.maximal_speed = 1.5;
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.geometry.minimal_allowed_extension[2] = -0.1;
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.geometry.effector_joints.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_geometry_bands_must_fit_the_actuator_bounds() {
        // Default bands are [0.2, 0.8]; narrow the commandable stroke
        // underneath them and the rig is inconsistent.
        let mut config = RigConfig::default();
        config.actuators.minimal_extension = 0.3;
        config.actuators.maximal_extension = 0.7;
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));

        config.geometry.minimal_allowed_extension = vec![0.3; ACTUATOR_COUNT];
        config.geometry.maximal_allowed_extension = vec![0.7; ACTUATOR_COUNT];
        config.validate().unwrap();
    }

    #[test]
    fn test_correction_tables_round_trip() {
        let file = CorrectionTableFile::from_tables(vec![
            vec![[0.1, 0.12], [0.5, 0.48], [0.7, 0.69]],
            vec![[0.1, 0.09], [0.7, 0.71]],
        ]);
        let rendered = toml::to_string(&file).unwrap();
        let loaded: CorrectionTableFile = toml::from_str(&rendered).unwrap();
        assert_eq!(loaded, file);

        let corrections = loaded.corrections();
        assert_eq!(corrections.len(), 2);
        assert!(matches!(&corrections[0], Correction::Table(points) if points.len() == 3));
    }
}
