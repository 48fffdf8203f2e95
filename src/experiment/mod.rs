//! Scan orchestration.
//!
//! # Architecture
//!
//! - **Mesh**: ordered chamber coordinates for one run ([`mesh`])
//! - **Acquisition**: analyzer settings and per-point samples ([`acquisition`])
//! - **Run engine**: state machine that walks the mesh, recovers from faults and
//!   hands the samples to storage ([`run_engine`])
//! - **Events**: progress, log and position updates for observers ([`events`])
//!
//! # Example
//!
//! ```rust,ignore
//! use chamber_scan::experiment::{ScanOrchestrator, ScanPlan};
//!
//! let orchestrator = ScanOrchestrator::new(chamber, analyzer);
//! let mut events = orchestrator.subscribe();
//! let handle = orchestrator.start(ScanPlan::new(mesh, task, "data")).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! let outcome = handle.wait().await?;
//! ```

pub mod acquisition;
pub mod events;
pub mod mesh;
pub mod progress;
pub mod run_engine;

pub use acquisition::{AcquisitionTask, SParameter, SampleRecord, TracePoint};
pub use events::{Completion, PositionUpdate, ProgressUpdate, ScanEvent};
pub use mesh::{AxisRange, MeshConfig, MeshPoint, Point3D, Traversal};
pub use progress::ProgressTracker;
pub use run_engine::{
    PointPhase, ScanHandle, ScanOrchestrator, ScanOutcome, ScanPlan, ScanState, StopSignal,
};
