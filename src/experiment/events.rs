//! Events published by a running scan.
//!
//! A run emits a stream of [`ScanEvent`]s on a broadcast channel so that a UI or
//! CLI can follow it without touching the run itself:
//!
//! ```text
//! State(Running)
//!    │
//!    ├── Log / Position  (each protocol step, each confirmed move)
//!    ├── Progress        (after every completed point)
//!    │
//! State(Completed | Interrupted | Fatal)
//! Completed              (result file written)
//! ```

use serde::Serialize;
use std::path::PathBuf;

use super::mesh::Point3D;
use super::run_engine::ScanState;

/// Event emitted by the run engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanEvent {
    /// Engine state changed.
    State {
        /// New state.
        state: ScanState,
    },
    /// A point finished.
    Progress(ProgressUpdate),
    /// Human-readable status line.
    Log {
        /// Message text.
        message: String,
    },
    /// The positioner confirmed a move.
    Position(PositionUpdate),
    /// The result file was written.
    Completed(Completion),
}

impl ScanEvent {
    /// Build a log event.
    pub fn log(message: impl Into<String>) -> Self {
        ScanEvent::Log {
            message: message.into(),
        }
    }
}

/// Progress snapshot after a completed point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    /// Points in the mesh.
    pub total_points: usize,
    /// Points completed so far.
    pub points_done: usize,
    /// Outer-loop passes in the mesh.
    pub total_layers: usize,
    /// Zero-based pass of the completed point.
    pub layer_index: usize,
    /// Points per pass.
    pub points_per_layer: usize,
    /// Zero-based position of the completed point within its pass.
    pub point_in_layer_index: usize,
    /// Display text.
    pub status_text: String,
    /// Estimated seconds remaining.
    pub eta_seconds: u64,
    /// Fault retries spent on the completed point.
    pub retries: u32,
    /// Fault retries spent over the run.
    pub total_retries: u64,
}

/// Confirmed position change. Absent fields did not change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PositionUpdate {
    /// Absolute chamber coordinates.
    Absolute {
        /// X, if moved.
        x: Option<f64>,
        /// Y, if moved.
        y: Option<f64>,
        /// Z, if moved.
        z: Option<f64>,
    },
    /// Offsets from the previous position.
    Relative {
        /// X offset.
        dx: Option<f64>,
        /// Y offset.
        dy: Option<f64>,
        /// Z offset.
        dz: Option<f64>,
    },
}

impl PositionUpdate {
    /// Absolute update with all three axes.
    pub fn absolute(p: Point3D) -> Self {
        PositionUpdate::Absolute {
            x: Some(p.x),
            y: Some(p.y),
            z: Some(p.z),
        }
    }

    /// Relative update with all three axes.
    pub fn relative(delta: Point3D) -> Self {
        PositionUpdate::Relative {
            dx: Some(delta.x),
            dy: Some(delta.y),
            dz: Some(delta.z),
        }
    }
}

/// Final notice of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    /// Where the result was written.
    pub result_file: PathBuf,
    /// Run duration as `HH:MM:SS`.
    pub duration_formatted: String,
    /// True if the run stopped on request before the last point.
    pub interrupted: bool,
}
