//! Result assembly and persistence.
//!
//! [`ResultAssembler`] buffers [`SampleRecord`]s as they arrive and merges them into
//! dense rows, one per (point, frequency):
//!
//! ```text
//! [x, y, z, frequency, amp_1, phase_1, amp_2, phase_2, ...]
//! ```
//!
//! Amplitude/phase pairs follow the S11, S12, S22 column order, with columns only
//! for requested parameters. Coordinates are relative to the run's zero position.
//! Snake scans are re-sorted by (z, y, x, frequency) so the file layout does not
//! depend on the path the positioner took.
//!
//! The file itself is a JSON document `{ "header": ..., "rows": [...] }`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{AppResult, ScanError};
use crate::experiment::acquisition::{AcquisitionTask, SampleRecord, SParameter, FIRST_VALUE_COLUMN};
use crate::experiment::mesh::{MeshConfig, Point3D, Traversal};
use crate::metadata::RunMetadata;
use crate::timing::format_duration;

const MAX_NAME_ATTEMPTS: usize = 100;

/// Axis description in the zero-relative frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisHeader {
    /// Smallest coordinate.
    pub min: f64,
    /// Largest coordinate.
    pub max: f64,
    /// Number of samples.
    pub steps: usize,
}

impl AxisHeader {
    fn from_values(values: &[f64]) -> Self {
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Self {
            min,
            max,
            steps: values.len(),
        }
    }
}

/// Header object of a result file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanHeader {
    /// Run identity and timestamps.
    pub metadata: RunMetadata,
    /// X axis relative to the zero position.
    pub x: AxisHeader,
    /// Y axis relative to the zero position.
    pub y: AxisHeader,
    /// Z axis relative to the zero position.
    pub z: AxisHeader,
    /// Mesh as configured, in chamber coordinates.
    pub mesh: MeshConfig,
    /// Chamber coordinate used as logical origin.
    pub zero_position: Point3D,
    /// Positioner jog speed (mm/min).
    pub move_speed: f64,
    /// Instrument settings (parameters, sweep, bandwidth, power, averages).
    pub acquisition: AcquisitionTask,
    /// Run duration in seconds.
    pub elapsed_seconds: f64,
    /// Run duration as `HH:MM:SS`.
    pub elapsed: String,
    /// Points acquired.
    pub points_acquired: usize,
    /// False if the run was interrupted.
    pub complete: bool,
}

impl ScanHeader {
    /// Header for a run that has not finished yet.
    pub fn new(
        metadata: RunMetadata,
        mesh: &MeshConfig,
        acquisition: &AcquisitionTask,
        zero_position: Point3D,
        move_speed: f64,
    ) -> Self {
        let axis = |values: Vec<f64>, offset: f64, zero: f64| {
            let shifted: Vec<f64> = values.into_iter().map(|v| v + offset - zero).collect();
            AxisHeader::from_values(&shifted)
        };
        Self {
            metadata,
            x: axis(mesh.x.values(), mesh.offset.x, zero_position.x),
            y: axis(mesh.y.values(), mesh.offset.y, zero_position.y),
            z: axis(mesh.z.values(), mesh.offset.z, zero_position.z),
            mesh: mesh.clone(),
            zero_position,
            move_speed,
            acquisition: acquisition.clone(),
            elapsed_seconds: 0.0,
            elapsed: format_duration(Duration::ZERO),
            points_acquired: 0,
            complete: false,
        }
    }

    /// Values per row.
    pub fn row_width(&self) -> usize {
        FIRST_VALUE_COLUMN + 2 * self.acquisition.parameters.len()
    }
}

/// Terminal artifact of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Header object.
    pub header: ScanHeader,
    /// Dense rows.
    pub rows: Vec<Vec<f64>>,
}

impl ScanResult {
    /// File name derived from start time and run id.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.file_stem())
    }

    fn file_stem(&self) -> String {
        format!(
            "scan_{}_{}",
            self.header.metadata.started_at.format("%Y%m%d_%H%M%S"),
            self.header.metadata.short_id()
        )
    }

    /// Write into `dir` (created if missing) and return the file path.
    ///
    /// Existing files are never replaced: if the name is taken, a numeric
    /// suffix is appended.
    pub fn write_to_dir(&self, dir: impl AsRef<Path>) -> AppResult<PathBuf> {
        let dir = dir.as_ref();
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|e| {
                ScanError::Storage(format!("failed to create {}: {e}", dir.display()))
            })?;
        }

        let stem = self.file_stem();
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let path = match attempt {
                0 => dir.join(format!("{stem}.json")),
                n => dir.join(format!("{stem}_{n}.json")),
            };
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    self.write_file(file, &path)?;
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    warn!(path = %path.display(), "Result file exists, trying another name");
                }
                Err(e) => {
                    return Err(ScanError::Storage(format!(
                        "failed to create {}: {e}",
                        path.display()
                    )))
                }
            }
        }
        Err(ScanError::Storage(format!(
            "no free file name for {stem} in {}",
            dir.display()
        )))
    }

    /// Write to `path`, replacing any existing file.
    pub fn write_to(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| ScanError::Storage(format!("failed to create {}: {e}", path.display())))?;
        self.write_file(file, path)
    }

    fn write_file(&self, file: File, path: &Path) -> AppResult<()> {
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        info!(
            path = %path.display(),
            rows = self.rows.len(),
            "Scan result written"
        );
        Ok(())
    }
}

/// Frequency wrapper with a total order.
#[derive(Debug, Clone, Copy)]
struct FreqKey(f64);

impl PartialEq for FreqKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for FreqKey {}

impl PartialOrd for FreqKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FreqKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone)]
struct PendingRow {
    position: Point3D,
    values: Vec<Option<(f64, f64)>>,
}

/// Merges sample records into dense rows.
#[derive(Debug, Clone)]
pub struct ResultAssembler {
    header: ScanHeader,
    rows: BTreeMap<(usize, FreqKey), PendingRow>,
    points: BTreeSet<usize>,
}

impl ResultAssembler {
    /// Empty assembler for a run described by `header`.
    pub fn new(header: ScanHeader) -> Self {
        Self {
            header,
            rows: BTreeMap::new(),
            points: BTreeSet::new(),
        }
    }

    /// Header the result will carry.
    pub fn header(&self) -> &ScanHeader {
        &self.header
    }

    /// Distinct points with at least one record.
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Add one record. Records may arrive in any order.
    pub fn push(&mut self, record: SampleRecord) -> AppResult<()> {
        let column = self.column_of(record.parameter)?;
        let width = self.header.acquisition.parameters.len();
        let row = self
            .rows
            .entry((record.point_index, FreqKey(record.frequency_hz)))
            .or_insert_with(|| PendingRow {
                position: record.position,
                values: vec![None; width],
            });
        row.values[column] = Some((record.amplitude, record.phase_deg));
        self.points.insert(record.point_index);
        Ok(())
    }

    /// Add several records. Either all of them are taken or none is.
    pub fn extend(&mut self, records: impl IntoIterator<Item = SampleRecord>) -> AppResult<()> {
        let records: Vec<SampleRecord> = records.into_iter().collect();
        for record in &records {
            self.column_of(record.parameter)?;
        }
        for record in records {
            self.push(record)?;
        }
        Ok(())
    }

    fn column_of(&self, parameter: SParameter) -> AppResult<usize> {
        self.header
            .acquisition
            .parameters
            .iter()
            .position(|p| *p == parameter)
            .ok_or_else(|| {
                ScanError::Format(format!("{parameter} was not requested for this run"))
            })
    }

    /// Dense rows in file order. Rows missing a parameter are dropped.
    pub fn rows(&self) -> Vec<Vec<f64>> {
        let mut rows: Vec<Vec<f64>> = self
            .rows
            .iter()
            .filter_map(|((point, freq), pending)| {
                let mut row = Vec::with_capacity(self.header.row_width());
                row.extend([pending.position.x, pending.position.y, pending.position.z, freq.0]);
                for value in &pending.values {
                    match value {
                        Some((amp, phase)) => row.extend([*amp, *phase]),
                        None => {
                            warn!(point, frequency = freq.0, "Dropping incomplete row");
                            return None;
                        }
                    }
                }
                Some(row)
            })
            .collect();

        if self.header.mesh.traversal == Traversal::Snake {
            canonical_sort(&mut rows);
        }
        rows
    }

    /// Close the run and produce the result.
    pub fn finalize(self, elapsed: Duration, complete: bool) -> ScanResult {
        let rows = self.rows();
        let mut header = self.header;
        header.elapsed_seconds = elapsed.as_secs_f64();
        header.elapsed = format_duration(elapsed);
        header.points_acquired = self.points.len();
        header.complete = complete;
        ScanResult { header, rows }
    }
}

/// Sort rows by (z, y, x, frequency) ascending.
pub fn canonical_sort(rows: &mut [Vec<f64>]) {
    rows.sort_by(|a, b| {
        [2, 1, 0, 3]
            .iter()
            .map(|&i| a[i].total_cmp(&b[i]))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
}
