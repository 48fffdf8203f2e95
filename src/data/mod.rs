//! Result persistence.
//!
//! - [`storage`]: merges sample records into dense rows and writes result files.
//! - [`reader`]: loads result files back into an indexed dataset.
//! - [`fault_journal`]: append-only record of generic hardware faults.

pub mod fault_journal;
pub mod reader;
pub mod storage;

pub use fault_journal::FaultJournal;
pub use reader::{Quantity, ScanDataset, ScanResultReader};
pub use storage::{ResultAssembler, ScanHeader, ScanResult};
