//! Run metadata stored in every result header.
//!
//! Storing rich metadata alongside the primary data is crucial for reproducibility:
//! a result file should say which run produced it, when, and with which software.
//!
//! ## `RunMetadata` Struct
//!
//! - **`run_id`**: A random UUID identifying the run.
//! - **`experiment_name`** / **`description`**: Free text supplied by the operator.
//! - **`started_at`**: Local wall-clock start time, serialized as RFC 3339.
//! - **`software_version`**: Automatically captures the version of this crate, so
//!   that data can be re-analyzed correctly in the future.
//!
//! A `RunMetadataBuilder` is provided for ergonomic construction.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Captures descriptive metadata for a scan run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// The name of the experiment.
    pub experiment_name: String,
    /// A detailed description of the experiment.
    pub description: String,
    /// When the run started.
    pub started_at: DateTime<Local>,
    /// Version of the acquisition software.
    pub software_version: String,
}

impl Default for RunMetadata {
    fn default() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            experiment_name: "Chamber scan".to_string(),
            description: String::new(),
            started_at: Local::now(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl RunMetadata {
    /// Short run id for file names.
    pub fn short_id(&self) -> String {
        self.run_id.simple().to_string()[..8].to_string()
    }

    /// Copy for a new run: fresh id and start time, same descriptive fields.
    pub fn for_new_run(&self) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Local::now(),
            ..self.clone()
        }
    }
}

/// A builder for constructing `RunMetadata` instances.
#[derive(Default)]
pub struct RunMetadataBuilder {
    inner: RunMetadata,
}

impl RunMetadataBuilder {
    /// Start from defaults (fresh id, current time).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the experiment name.
    pub fn experiment_name(mut self, name: &str) -> Self {
        self.inner.experiment_name = name.to_string();
        self
    }

    /// Set the description.
    pub fn description(mut self, description: &str) -> Self {
        self.inner.description = description.to_string();
        self
    }

    /// Finish.
    pub fn build(self) -> RunMetadata {
        self.inner
    }
}
