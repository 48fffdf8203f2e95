//! Hardware abstraction layer.
//!
//! - [`capabilities`]: traits the run engine talks to (`MotionController`,
//!   `NetworkAnalyzer`) and the shared analyzer configuration sequence.
//! - [`mock`]: simulated positioner and analyzer with scripted fault injection,
//!   used by the tests and by `chamber_scan run`.

pub mod capabilities;
pub mod mock;

pub use capabilities::{Axis, MeasurementSetup, MotionController, NetworkAnalyzer};
