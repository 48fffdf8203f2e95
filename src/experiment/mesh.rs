//! Scan mesh generation.
//!
//! Turns a [`MeshConfig`] into the ordered list of chamber coordinates visited during
//! a run. Generation is pure: the same configuration always yields the same
//! sequence.
//!
//! Two traversals are supported:
//!
//! - [`Traversal::AxisMajor`]: z outermost, then y, then x, all ascending.
//! - [`Traversal::Snake`]: y outermost, x alternating direction per row (the first
//!   row runs from the x stop towards the x start), z ascending innermost. The first
//!   z layer at every new (x, y) column gets an approach move from below to take up
//!   the vertical backlash.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default vertical clearance for snake approach moves, in millimeters.
pub const DEFAULT_CLEARANCE_MM: f64 = 1.0;

/// Absolute chamber coordinate in millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3D {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
    /// Z coordinate.
    pub z: f64,
}

impl Point3D {
    /// Create a point.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Component-wise `self - other`.
    pub fn relative_to(&self, origin: &Point3D) -> Point3D {
        Point3D::new(self.x - origin.x, self.y - origin.y, self.z - origin.z)
    }

    /// True if every component is finite.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl fmt::Display for Point3D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

/// Linear range along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    /// First coordinate (mesh-local).
    pub start: f64,
    /// Last coordinate (mesh-local).
    pub stop: f64,
    /// Number of samples, at least 1.
    pub steps: usize,
}

impl AxisRange {
    /// Create a range.
    pub const fn new(start: f64, stop: f64, steps: usize) -> Self {
        Self { start, stop, steps }
    }

    /// Single-sample range.
    pub const fn fixed(value: f64) -> Self {
        Self::new(value, value, 1)
    }

    /// Evenly spaced samples from `start` to `stop` inclusive.
    ///
    /// One step collapses to `[start]`; zero steps yields nothing.
    pub fn values(&self) -> Vec<f64> {
        linspace(self.start, self.stop, self.steps)
    }
}

/// `n` evenly spaced values between `start` and `stop` inclusive.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { stop } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// Mesh traversal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Traversal {
    /// Nested z/y/x loops, all ascending.
    #[default]
    AxisMajor,
    /// Boustrophedon over x, rows along y, z columns.
    Snake,
}

impl fmt::Display for Traversal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Traversal::AxisMajor => write!(f, "axis_major"),
            Traversal::Snake => write!(f, "snake"),
        }
    }
}

/// Immutable description of a scan mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// X range (mesh-local).
    pub x: AxisRange,
    /// Y range (mesh-local).
    pub y: AxisRange,
    /// Z range (mesh-local).
    pub z: AxisRange,
    /// Chamber coordinate of mesh-local zero.
    #[serde(default)]
    pub offset: Point3D,
    /// Traversal order.
    #[serde(default)]
    pub traversal: Traversal,
    /// Distance below the first z layer used for snake approach moves.
    #[serde(default = "default_clearance")]
    pub clearance_mm: f64,
}

fn default_clearance() -> f64 {
    DEFAULT_CLEARANCE_MM
}

impl MeshConfig {
    /// Axis-major mesh without offset.
    pub fn new(x: AxisRange, y: AxisRange, z: AxisRange) -> Self {
        Self {
            x,
            y,
            z,
            offset: Point3D::default(),
            traversal: Traversal::AxisMajor,
            clearance_mm: DEFAULT_CLEARANCE_MM,
        }
    }

    /// Set the traversal.
    pub fn with_traversal(mut self, traversal: Traversal) -> Self {
        self.traversal = traversal;
        self
    }

    /// Set the chamber offset of mesh-local zero.
    pub fn with_offset(mut self, offset: Point3D) -> Self {
        self.offset = offset;
        self
    }

    /// Set the snake approach clearance.
    pub fn with_clearance(mut self, clearance_mm: f64) -> Self {
        self.clearance_mm = clearance_mm;
        self
    }

    /// Total number of points.
    pub fn point_count(&self) -> usize {
        self.x.steps * self.y.steps * self.z.steps
    }

    /// Number of consecutive points sharing one outer-loop index.
    pub fn layer_size(&self) -> usize {
        match self.traversal {
            Traversal::AxisMajor => self.x.steps * self.y.steps,
            Traversal::Snake => self.x.steps * self.z.steps,
        }
    }

    /// Number of outer-loop passes.
    pub fn layer_count(&self) -> usize {
        match self.traversal {
            Traversal::AxisMajor => self.z.steps,
            Traversal::Snake => self.y.steps,
        }
    }

    /// Check structural invariants. Envelope checks live in
    /// [`crate::config::ChamberEnvelope`].
    pub fn validate(&self) -> Result<(), String> {
        for (name, axis) in [("x", &self.x), ("y", &self.y), ("z", &self.z)] {
            if axis.steps == 0 {
                return Err(format!("{name} axis must have at least one step"));
            }
            if !axis.start.is_finite() || !axis.stop.is_finite() {
                return Err(format!("{name} axis bounds must be finite"));
            }
        }
        if !self.offset.is_finite() {
            return Err("mesh offset must be finite".to_string());
        }
        if !self.clearance_mm.is_finite() || self.clearance_mm < 0.0 {
            return Err(format!(
                "clearance must be a non-negative distance, got {}",
                self.clearance_mm
            ));
        }
        Ok(())
    }
}

/// One stop of the traversal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshPoint {
    /// Absolute measurement position.
    pub position: Point3D,
    /// Absolute position to visit just before `position`, if any.
    pub approach: Option<Point3D>,
}

/// Generate the traversal for `config`.
pub fn generate(config: &MeshConfig) -> Vec<MeshPoint> {
    match config.traversal {
        Traversal::AxisMajor => axis_major(config),
        Traversal::Snake => snake(config),
    }
}

/// Measurement positions only, in traversal order.
pub fn points(config: &MeshConfig) -> Vec<Point3D> {
    generate(config).into_iter().map(|p| p.position).collect()
}

fn axis_major(config: &MeshConfig) -> Vec<MeshPoint> {
    let (xs, ys, zs) = offset_axes(config);
    let mut out = Vec::with_capacity(config.point_count());
    for &z in &zs {
        for &y in &ys {
            for &x in &xs {
                out.push(MeshPoint {
                    position: Point3D::new(x, y, z),
                    approach: None,
                });
            }
        }
    }
    out
}

fn snake(config: &MeshConfig) -> Vec<MeshPoint> {
    let (mut xs, ys, zs) = offset_axes(config);
    let mut out = Vec::with_capacity(config.point_count());
    let Some(&z_start) = zs.first() else {
        return out;
    };
    for &y in &ys {
        xs.reverse();
        for &x in &xs {
            for (k, &z) in zs.iter().enumerate() {
                let approach = (k == 0).then(|| Point3D::new(x, y, z_start - config.clearance_mm));
                out.push(MeshPoint {
                    position: Point3D::new(x, y, z),
                    approach,
                });
            }
        }
    }
    out
}

fn offset_axes(config: &MeshConfig) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let shift = |axis: &AxisRange, by: f64| -> Vec<f64> {
        axis.values().into_iter().map(|v| v + by).collect()
    };
    (
        shift(&config.x, config.offset.x),
        shift(&config.y, config.offset.y),
        shift(&config.z, config.offset.z),
    )
}
