//! Configuration System using Figment
//!
//! Settings are loaded from:
//! 1. A TOML file (base configuration, `config/scan.toml` by default)
//! 2. Environment variables (prefixed with `CHAMBER_`)
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! CHAMBER_APPLICATION__LOG_LEVEL=debug
//! CHAMBER_CHAMBER__JOG_SPEED=3000
//! CHAMBER_RECOVERY__BACKOFF_MS=250
//! ```
//!
//! # Example
//!
//! ```no_run
//! use chamber_scan::config::Settings;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load_from("config/scan.toml")?;
//!     println!("Points: {}", settings.mesh.point_count());
//!     Ok(())
//! }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AppResult, ScanError};
use crate::error_recovery::RetryPolicy;
use crate::experiment::acquisition::AcquisitionTask;
use crate::experiment::mesh::{MeshConfig, MeshPoint, Point3D};

/// Default settings file.
pub const DEFAULT_CONFIG_PATH: &str = "config/scan.toml";

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Result and fault-log locations
    pub storage: StorageConfig,
    /// Positioner settings
    pub chamber: ChamberConfig,
    /// Scan mesh
    pub mesh: MeshConfig,
    /// Inline acquisition task
    #[serde(default)]
    pub acquisition: Option<AcquisitionTask>,
    /// Preset file to load the acquisition task from, used when `acquisition` is absent
    #[serde(default)]
    pub acquisition_preset: Option<PathBuf>,
    /// Analyzer session settings
    #[serde(default)]
    pub instrument: InstrumentConfig,
    /// Fault retry policy
    #[serde(default)]
    pub recovery: RetryPolicy,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name, used as the experiment name in result headers
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for result files
    pub output_dir: PathBuf,
    /// Append-only fault journal
    #[serde(default)]
    pub fault_log: Option<PathBuf>,
}

/// Positioner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChamberConfig {
    /// Jog speed in mm/min
    #[serde(default = "default_jog_speed")]
    pub jog_speed: f64,
    /// Home all axes before the first point
    #[serde(default)]
    pub home_before_scan: bool,
    /// Reachable volume
    pub envelope: ChamberEnvelope,
    /// Chamber coordinate stored as (0, 0, 0) in results
    #[serde(default)]
    pub zero: Point3D,
}

/// Analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// VISA resource string (e.g., "GPIB0::16::INSTR")
    #[serde(default = "default_resource")]
    pub resource: String,
    /// Prefix for measurement names defined on the analyzer
    #[serde(default = "default_measurement_prefix")]
    pub measurement_prefix: String,
    /// Apply the acquisition task before the first point
    #[serde(default = "default_configure_on_start")]
    pub configure_on_start: bool,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            resource: default_resource(),
            measurement_prefix: default_measurement_prefix(),
            configure_on_start: default_configure_on_start(),
        }
    }
}

/// Axis-aligned box of reachable chamber coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChamberEnvelope {
    /// Lower corner
    pub min: Point3D,
    /// Upper corner
    pub max: Point3D,
}

impl ChamberEnvelope {
    /// Envelope spanning `min` to `max`.
    pub fn new(min: Point3D, max: Point3D) -> Self {
        Self { min, max }
    }

    /// True if `p` lies inside the envelope, bounds included.
    pub fn contains(&self, p: &Point3D) -> bool {
        (self.min.x..=self.max.x).contains(&p.x)
            && (self.min.y..=self.max.y).contains(&p.y)
            && (self.min.z..=self.max.z).contains(&p.z)
    }

    /// Reject a traversal that leaves the envelope, approach moves included.
    pub fn check(&self, points: &[MeshPoint]) -> AppResult<()> {
        for (i, point) in points.iter().enumerate() {
            if !self.contains(&point.position) {
                return Err(ScanError::Precondition(format!(
                    "point {i} at {} is outside the chamber envelope {} .. {}",
                    point.position, self.min, self.max
                )));
            }
            if let Some(approach) = point.approach.filter(|a| !self.contains(a)) {
                return Err(ScanError::Precondition(format!(
                    "approach move for point {i} to {approach} is outside the chamber envelope {} .. {}",
                    self.min, self.max
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "Chamber scan".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_jog_speed() -> f64 {
    1500.0
}

fn default_resource() -> String {
    "GPIB0::16::INSTR".to_string()
}

fn default_measurement_prefix() -> String {
    "chamber".to_string()
}

fn default_configure_on_start() -> bool {
    true
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment, then validate.
    ///
    /// Environment variables take precedence over the file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CHAMBER_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Jog speed is positive and finite
    /// - The envelope is well-formed and contains the zero position
    /// - The mesh is structurally valid
    /// - An inline acquisition task, if any, is consistent
    /// - Exactly one of `acquisition` and `acquisition_preset` is given
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ScanError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if !(self.chamber.jog_speed.is_finite() && self.chamber.jog_speed > 0.0) {
            return Err(ScanError::Configuration(format!(
                "Invalid jog_speed {}. Must be a positive speed in mm/min",
                self.chamber.jog_speed
            )));
        }

        let envelope = &self.chamber.envelope;
        if !(envelope.min.is_finite() && envelope.max.is_finite())
            || envelope.min.x > envelope.max.x
            || envelope.min.y > envelope.max.y
            || envelope.min.z > envelope.max.z
        {
            return Err(ScanError::Configuration(format!(
                "Invalid chamber envelope {} .. {}",
                envelope.min, envelope.max
            )));
        }
        if !envelope.contains(&self.chamber.zero) {
            return Err(ScanError::Configuration(format!(
                "Zero position {} is outside the chamber envelope",
                self.chamber.zero
            )));
        }

        self.mesh.validate().map_err(ScanError::Configuration)?;

        match (&self.acquisition, &self.acquisition_preset) {
            (Some(task), None) => task.clone().normalized().validate()?,
            (None, Some(_)) => {}
            (Some(_), Some(_)) => {
                return Err(ScanError::Configuration(
                    "Set either 'acquisition' or 'acquisition_preset', not both".into(),
                ))
            }
            (None, None) => {
                return Err(ScanError::Configuration(
                    "Missing 'acquisition' section or 'acquisition_preset' path".into(),
                ))
            }
        }

        self.recovery
            .validate()
            .map_err(|e| ScanError::Configuration(format!("Invalid recovery policy: {e}")))?;

        if self.instrument.measurement_prefix.trim().is_empty() {
            return Err(ScanError::Configuration(
                "measurement_prefix must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// The acquisition task for the next run, reading the preset file if needed.
    pub fn acquisition_task(&self) -> AppResult<AcquisitionTask> {
        match (&self.acquisition, &self.acquisition_preset) {
            (Some(task), _) => {
                let task = task.clone().normalized();
                task.validate()?;
                Ok(task)
            }
            (None, Some(path)) => AcquisitionTask::load_preset(path),
            (None, None) => Err(ScanError::Configuration(
                "no acquisition task configured".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::acquisition::SParameter;
    use crate::experiment::mesh::{generate, AxisRange, Traversal};
    use figment::Jail;

    const SAMPLE: &str = r#"
        [application]
        name = "Horn antenna"
        log_level = "debug"

        [storage]
        output_dir = "data"
        fault_log = "data/faults.log"

        [chamber]
        jog_speed = 2000.0
        envelope = { min = { x = 0.0, y = 0.0, z = 0.0 }, max = { x = 400.0, y = 400.0, z = 300.0 } }
        zero = { x = 200.0, y = 200.0, z = 50.0 }

        [mesh]
        x = { start = -20.0, stop = 20.0, steps = 5 }
        y = { start = -20.0, stop = 20.0, steps = 5 }
        z = { start = 0.0, stop = 10.0, steps = 2 }
        offset = { x = 200.0, y = 200.0, z = 50.0 }
        traversal = "snake"

        [acquisition]
        parameters = ["S22", "S11"]
        freq_start_hz = 8.0e9
        freq_stop_hz = 12.0e9
        points = 201
        if_bandwidth_hz = 1000.0
        power_dbm = -5.0

        [recovery]
        backoff_ms = 500
    "#;

    #[test]
    fn test_load_sample() {
        Jail::expect_with(|jail| {
            jail.create_file("scan.toml", SAMPLE)?;
            let settings = Settings::load_from("scan.toml").map_err(|e| e.to_string())?;

            assert_eq!(settings.application.name, "Horn antenna");
            assert_eq!(settings.mesh.traversal, Traversal::Snake);
            assert_eq!(settings.mesh.point_count(), 50);
            assert_eq!(settings.recovery.timeout_threshold, 3);
            assert_eq!(settings.recovery.backoff_delay.as_millis(), 500);
            assert_eq!(settings.instrument.measurement_prefix, "chamber");
            assert!(settings.instrument.configure_on_start);

            let task = settings.acquisition_task().map_err(|e| e.to_string())?;
            assert_eq!(task.parameters, vec![SParameter::S11, SParameter::S22]);
            assert_eq!(task.average_count, 1);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("scan.toml", SAMPLE)?;
            jail.set_env("CHAMBER_APPLICATION__LOG_LEVEL", "warn");
            jail.set_env("CHAMBER_CHAMBER__JOG_SPEED", "3000");
            let settings = Settings::load_from("scan.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings.application.log_level, "warn");
            assert_eq!(settings.chamber.jog_speed, 3000.0);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("scan.toml", SAMPLE)?;

            jail.set_env("CHAMBER_APPLICATION__LOG_LEVEL", "verbose");
            let err = Settings::load_from("scan.toml").unwrap_err();
            assert!(err.to_string().contains("Invalid log_level"));

            jail.set_env("CHAMBER_APPLICATION__LOG_LEVEL", "info");
            jail.set_env("CHAMBER_MESH__Z__STEPS", "0");
            let err = Settings::load_from("scan.toml").unwrap_err();
            assert!(err.to_string().contains("z axis"));

            jail.set_env("CHAMBER_MESH__Z__STEPS", "2");
            jail.set_env("CHAMBER_ACQUISITION__FREQ_STOP_HZ", "1000000000");
            let err = Settings::load_from("scan.toml").unwrap_err();
            assert!(err.to_string().contains("frequency sweep"));

            jail.set_env("CHAMBER_ACQUISITION__FREQ_STOP_HZ", "12000000000");
            jail.set_env("CHAMBER_RECOVERY__TIMEOUT_THRESHOLD", "0");
            let err = Settings::load_from("scan.toml").unwrap_err();
            assert!(err.to_string().contains("timeout_threshold"));
            Ok(())
        });
    }

    #[test]
    fn test_preset_is_used_when_inline_task_absent() {
        Jail::expect_with(|jail| {
            let inline = SAMPLE.split("[acquisition]").next().unwrap_or_default();
            jail.create_file(
                "scan.toml",
                &format!("acquisition_preset = \"xband.json\"\n{inline}"),
            )?;
            jail.create_file(
                "xband.json",
                r#"{"parameters":["S12"],"freq_start_hz":8e9,"freq_stop_hz":12e9,
                    "points":11,"if_bandwidth_hz":100.0,"power_dbm":0.0,"average_count":4}"#,
            )?;
            let settings = Settings::load_from("scan.toml").map_err(|e| e.to_string())?;
            let task = settings.acquisition_task().map_err(|e| e.to_string())?;
            assert_eq!(task.parameters, vec![SParameter::S12]);
            assert_eq!(task.average_count, 4);
            Ok(())
        });
    }

    #[test]
    fn test_envelope_check() {
        let envelope = ChamberEnvelope::new(
            Point3D::new(0.0, 0.0, 0.0),
            Point3D::new(100.0, 100.0, 50.0),
        );
        let mesh = MeshConfig::new(
            AxisRange::new(0.0, 100.0, 3),
            AxisRange::new(0.0, 100.0, 3),
            AxisRange::new(0.0, 50.0, 2),
        );
        assert!(envelope.check(&generate(&mesh)).is_ok());

        // Snake approach dips below z = 0
        let snake = mesh.clone().with_traversal(Traversal::Snake);
        let err = envelope.check(&generate(&snake)).unwrap_err();
        assert!(matches!(err, ScanError::Precondition(_)));
        assert!(err.to_string().contains("approach"));

        let shifted = mesh.with_offset(Point3D::new(10.0, 0.0, 0.0));
        let err = envelope.check(&generate(&shifted)).unwrap_err();
        assert!(err.to_string().contains("outside the chamber envelope"));
    }
}
