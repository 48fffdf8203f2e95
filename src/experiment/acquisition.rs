//! Instrument acquisition settings and per-point samples.

use crate::error::{AppResult, ScanError};
use crate::experiment::mesh::{linspace, Point3D};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Scattering parameter measured by the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SParameter {
    /// Reflection at port 1.
    S11,
    /// Transmission from port 2 to port 1.
    S12,
    /// Reflection at port 2.
    S22,
}

impl SParameter {
    /// All parameters in storage column order.
    pub const ALL: [SParameter; 3] = [SParameter::S11, SParameter::S12, SParameter::S22];

    /// Instrument-facing name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SParameter::S11 => "S11",
            SParameter::S12 => "S12",
            SParameter::S22 => "S22",
        }
    }
}

impl fmt::Display for SParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instrument configuration in force for one run.
///
/// The parameter list is kept sorted (S11, S12, S22); storage columns follow the
/// same order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionTask {
    /// Requested parameters.
    pub parameters: Vec<SParameter>,
    /// Sweep start frequency in Hz.
    pub freq_start_hz: f64,
    /// Sweep stop frequency in Hz.
    pub freq_stop_hz: f64,
    /// Points per sweep.
    pub points: usize,
    /// IF bandwidth in Hz.
    pub if_bandwidth_hz: f64,
    /// Source power in dBm.
    pub power_dbm: f64,
    /// Sweep averages.
    #[serde(default = "default_average_count")]
    pub average_count: u32,
}

fn default_average_count() -> u32 {
    1
}

impl AcquisitionTask {
    /// Build a validated task.
    pub fn new(
        parameters: Vec<SParameter>,
        freq_start_hz: f64,
        freq_stop_hz: f64,
        points: usize,
    ) -> AppResult<Self> {
        let task = Self {
            parameters,
            freq_start_hz,
            freq_stop_hz,
            points,
            if_bandwidth_hz: 1_000.0,
            power_dbm: 0.0,
            average_count: 1,
        }
        .normalized();
        task.validate()?;
        Ok(task)
    }

    /// Set IF bandwidth.
    pub fn with_if_bandwidth(mut self, hz: f64) -> Self {
        self.if_bandwidth_hz = hz;
        self
    }

    /// Set output power.
    pub fn with_power(mut self, dbm: f64) -> Self {
        self.power_dbm = dbm;
        self
    }

    /// Set average count.
    pub fn with_average_count(mut self, count: u32) -> Self {
        self.average_count = count;
        self
    }

    /// Sort parameters into column order.
    pub fn normalized(mut self) -> Self {
        self.parameters.sort();
        self
    }

    /// Check the task for consistency.
    pub fn validate(&self) -> AppResult<()> {
        if self.parameters.is_empty() {
            return Err(ScanError::Configuration(
                "at least one S-parameter must be requested".into(),
            ));
        }
        let mut sorted = self.parameters.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != self.parameters.len() {
            return Err(ScanError::Configuration(format!(
                "duplicate S-parameters requested: {:?}",
                self.parameters
            )));
        }
        if sorted != self.parameters {
            return Err(ScanError::Configuration(
                "S-parameters must be listed in S11, S12, S22 order".into(),
            ));
        }
        if !(self.freq_start_hz.is_finite() && self.freq_stop_hz.is_finite())
            || self.freq_start_hz > self.freq_stop_hz
        {
            return Err(ScanError::Configuration(format!(
                "invalid frequency sweep {} Hz .. {} Hz",
                self.freq_start_hz, self.freq_stop_hz
            )));
        }
        if self.points == 0 {
            return Err(ScanError::Configuration(
                "sweep must have at least one point".into(),
            ));
        }
        if self.average_count == 0 {
            return Err(ScanError::Configuration(
                "average count must be at least 1".into(),
            ));
        }
        if !(self.if_bandwidth_hz.is_finite() && self.if_bandwidth_hz > 0.0) {
            return Err(ScanError::Configuration(format!(
                "invalid IF bandwidth {} Hz",
                self.if_bandwidth_hz
            )));
        }
        Ok(())
    }

    /// Load a preset from a TOML or JSON file, chosen by extension.
    pub fn load_preset(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let task: AcquisitionTask = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            _ => toml::from_str(&text).map_err(|e| {
                ScanError::Configuration(format!("preset {}: {e}", path.display()))
            })?,
        };
        let task = task.normalized();
        task.validate()?;
        Ok(task)
    }

    /// Instrument measurement name for a parameter.
    pub fn measurement_name(&self, prefix: &str, parameter: SParameter) -> String {
        format!("{prefix}_{parameter}")
    }

    /// Nominal frequency axis.
    pub fn frequencies(&self) -> Vec<f64> {
        linspace(self.freq_start_hz, self.freq_stop_hz, self.points)
    }

    /// Column index of the amplitude for `parameter`, if requested.
    pub fn amplitude_column(&self, parameter: SParameter) -> Option<usize> {
        self.parameters
            .iter()
            .position(|p| *p == parameter)
            .map(|i| FIRST_VALUE_COLUMN + 2 * i)
    }
}

/// Rows start with x, y, z and frequency.
pub const FIRST_VALUE_COLUMN: usize = 4;

/// One bin of a trace read back from the analyzer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TracePoint {
    /// Frequency in Hz.
    pub frequency_hz: f64,
    /// Complex sample.
    pub value: Complex64,
}

impl TracePoint {
    /// Build from real and imaginary parts.
    pub fn new(frequency_hz: f64, re: f64, im: f64) -> Self {
        Self {
            frequency_hz,
            value: Complex64::new(re, im),
        }
    }
}

/// One amplitude/phase reading at one mesh point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRecord {
    /// Index of the point in traversal order.
    pub point_index: usize,
    /// Coordinate relative to the run's zero position.
    pub position: Point3D,
    /// Frequency in Hz.
    pub frequency_hz: f64,
    /// Parameter this reading belongs to.
    pub parameter: SParameter,
    /// Linear magnitude.
    pub amplitude: f64,
    /// Phase in degrees.
    pub phase_deg: f64,
}

impl SampleRecord {
    /// Convert a trace bin into a record.
    pub fn from_trace(
        point_index: usize,
        position: Point3D,
        parameter: SParameter,
        bin: &TracePoint,
    ) -> Self {
        Self {
            point_index,
            position,
            frequency_hz: bin.frequency_hz,
            parameter,
            amplitude: bin.value.norm(),
            phase_deg: bin.value.arg().to_degrees(),
        }
    }
}
