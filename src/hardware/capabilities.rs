//! Capability traits for the chamber hardware.
//!
//! The run engine depends only on these traits. Drivers for a real positioner or
//! analyzer implement them; [`crate::hardware::mock`] provides simulated devices.
//!
//! Every call is awaited to completion: a motion call returns only once the
//! controller reports the move finished, and analyzer calls return once the
//! instrument has answered.

use crate::error::DeviceResult;
use crate::experiment::acquisition::{AcquisitionTask, SParameter, TracePoint};
use crate::experiment::mesh::Point3D;
use async_trait::async_trait;
use std::fmt;
use tracing::debug;

/// Motion axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// X axis.
    X,
    /// Y axis.
    Y,
    /// Z axis.
    Z,
}

impl Axis {
    /// All three axes.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => f.write_str("X"),
            Axis::Y => f.write_str("Y"),
            Axis::Z => f.write_str("Z"),
        }
    }
}

/// Capability for the 3-axis chamber positioner.
#[async_trait]
pub trait MotionController: Send + Sync {
    /// Move to an absolute chamber coordinate at `speed` (mm/min).
    async fn move_absolute(&self, target: Point3D, speed: f64) -> DeviceResult<()>;

    /// Move by `delta` from the current position at `speed` (mm/min).
    async fn move_relative(&self, delta: Point3D, speed: f64) -> DeviceResult<()>;

    /// Run the homing cycle for `axes`.
    async fn home_axes(&self, axes: &[Axis]) -> DeviceResult<()>;
}

/// Settings for one analyzer measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSetup {
    /// Measurement name on the instrument.
    pub name: String,
    /// Parameter measured.
    pub parameter: SParameter,
    /// Sweep start in Hz.
    pub freq_start_hz: f64,
    /// Sweep stop in Hz.
    pub freq_stop_hz: f64,
    /// IF bandwidth in Hz.
    pub if_bandwidth_hz: f64,
    /// Sweep points.
    pub points: usize,
    /// Source power in dBm.
    pub power_dbm: f64,
    /// Hold the sweep until triggered.
    pub manual_trigger: bool,
    /// Sweep averages.
    pub average_count: u32,
}

impl MeasurementSetup {
    /// Derive the setup for `parameter` from a task.
    pub fn from_task(task: &AcquisitionTask, prefix: &str, parameter: SParameter) -> Self {
        Self {
            name: task.measurement_name(prefix, parameter),
            parameter,
            freq_start_hz: task.freq_start_hz,
            freq_stop_hz: task.freq_stop_hz,
            if_bandwidth_hz: task.if_bandwidth_hz,
            points: task.points,
            power_dbm: task.power_dbm,
            manual_trigger: true,
            average_count: task.average_count,
        }
    }
}

/// Capability for a GPIB/VISA vector network analyzer.
#[async_trait]
pub trait NetworkAnalyzer: Send + Sync {
    /// Preset the instrument and delete all measurements.
    async fn preset_and_clear(&self) -> DeviceResult<()>;

    /// Define a measurement.
    async fn add_measurement(&self, setup: &MeasurementSetup) -> DeviceResult<()>;

    /// Trigger one sweep of a measurement and wait for it to finish.
    async fn trigger_measurement(&self, name: &str) -> DeviceResult<()>;

    /// Read the last sweep of a measurement.
    async fn read_trace(&self, name: &str, parameter: SParameter) -> DeviceResult<Vec<TracePoint>>;

    /// Close the session, assert interface-in-charge on the bus and reopen.
    async fn reset_interface_in_charge(&self, resource: &str) -> DeviceResult<()>;
}

/// Preset the analyzer and define one manually triggered measurement per
/// requested parameter.
pub async fn apply_acquisition_task(
    analyzer: &dyn NetworkAnalyzer,
    task: &AcquisitionTask,
    prefix: &str,
) -> DeviceResult<()> {
    analyzer.preset_and_clear().await?;
    for &parameter in &task.parameters {
        let setup = MeasurementSetup::from_task(task, prefix, parameter);
        debug!(name = %setup.name, "Adding measurement");
        analyzer.add_measurement(&setup).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{AnalyzerCall, MockAnalyzer};

    #[tokio::test]
    async fn apply_task_presets_then_adds_each_parameter() {
        let analyzer = MockAnalyzer::new();
        let task = AcquisitionTask::new(vec![SParameter::S22, SParameter::S11], 1e9, 2e9, 3)
            .unwrap()
            .with_average_count(8);

        apply_acquisition_task(&analyzer, &task, "CH1").await.unwrap();

        let calls = analyzer.calls().await;
        assert_eq!(calls[0], AnalyzerCall::PresetAndClear);
        match (&calls[1], &calls[2]) {
            (AnalyzerCall::AddMeasurement(a), AnalyzerCall::AddMeasurement(b)) => {
                assert_eq!(a.name, "CH1_S11");
                assert_eq!(b.name, "CH1_S22");
                assert!(a.manual_trigger);
                assert_eq!(b.average_count, 8);
            }
            other => panic!("unexpected calls: {:?}", other),
        }
    }
}
