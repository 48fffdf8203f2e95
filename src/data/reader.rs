//! Loading result files back into a dense, indexed dataset.
//!
//! The axes are rebuilt from the header (`min`, `max`, `steps` per axis, sweep
//! bounds and point count), never from the rows. Each row is then placed into a
//! flat array indexed by
//! `(quantity, parameter, frequency, x, y, z)`, so any slice a plotting consumer
//! asks for is a direct lookup. Cells with no row (interrupted runs) read as `None`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::data::storage::{AxisHeader, ScanHeader, ScanResult};
use crate::error::{AppResult, ScanError};
use crate::experiment::acquisition::{SParameter, FIRST_VALUE_COLUMN};
use crate::experiment::mesh::linspace;

/// Which half of an amplitude/phase pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    /// Linear magnitude.
    Amplitude = 0,
    /// Phase in degrees.
    Phase = 1,
}

/// Upper bound on the dense lookup, in values. Headers asking for more are
/// treated as corrupt.
const MAX_VALUES: usize = 1 << 28;

/// Entry point for loading results.
pub struct ScanResultReader;

impl ScanResultReader {
    /// Load and index a result file.
    pub fn load(path: impl AsRef<Path>) -> AppResult<ScanDataset> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let result: ScanResult = serde_json::from_reader(BufReader::new(file))?;
        tracing::debug!(path = %path.display(), rows = result.rows.len(), "Loaded scan result");
        ScanDataset::from_result(result)
    }
}

/// Dense view of a scan result.
#[derive(Debug, Clone)]
pub struct ScanDataset {
    header: ScanHeader,
    x: Vec<f64>,
    y: Vec<f64>,
    z: Vec<f64>,
    frequencies: Vec<f64>,
    values: Vec<f64>,
    rows_indexed: usize,
}

impl ScanDataset {
    /// Index an in-memory result.
    pub fn from_result(result: ScanResult) -> AppResult<Self> {
        let ScanResult { header, rows } = result;
        let n_params = header.acquisition.parameters.len();
        if !(1..=SParameter::ALL.len()).contains(&n_params) {
            return Err(ScanError::Format(format!(
                "expected 1 to 3 parameters, found {n_params}"
            )));
        }

        let counts = [
            n_params,
            header.acquisition.points,
            header.x.steps,
            header.y.steps,
            header.z.steps,
        ];
        if counts.contains(&0) {
            return Err(ScanError::Format("header describes an empty axis".into()));
        }
        let len = counts
            .into_iter()
            .try_fold(2usize, |acc, n| acc.checked_mul(n))
            .filter(|&len| len <= MAX_VALUES)
            .ok_or_else(|| {
                ScanError::Format(format!(
                    "header describes more than {MAX_VALUES} values"
                ))
            })?;

        let axis = |h: &AxisHeader| linspace(h.min, h.max, h.steps);
        let x = axis(&header.x);
        let y = axis(&header.y);
        let z = axis(&header.z);
        let frequencies = header.acquisition.frequencies();
        let mut dataset = Self {
            header,
            x,
            y,
            z,
            frequencies,
            values: vec![f64::NAN; len],
            rows_indexed: 0,
        };

        let width = FIRST_VALUE_COLUMN + 2 * n_params;
        for (n, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(ScanError::Format(format!(
                    "row {n} has {} columns, expected {width}",
                    row.len()
                )));
            }
            let xi = axis_index(&dataset.x, row[0]).ok_or_else(|| off_axis(n, "x", row[0]))?;
            let yi = axis_index(&dataset.y, row[1]).ok_or_else(|| off_axis(n, "y", row[1]))?;
            let zi = axis_index(&dataset.z, row[2]).ok_or_else(|| off_axis(n, "z", row[2]))?;
            let fi = axis_index(&dataset.frequencies, row[3])
                .ok_or_else(|| off_axis(n, "frequency", row[3]))?;
            for p in 0..n_params {
                let column = FIRST_VALUE_COLUMN + 2 * p;
                let amp = dataset.offset(Quantity::Amplitude, p, fi, xi, yi, zi);
                let phase = dataset.offset(Quantity::Phase, p, fi, xi, yi, zi);
                dataset.values[amp] = row[column];
                dataset.values[phase] = row[column + 1];
            }
            dataset.rows_indexed += 1;
        }
        Ok(dataset)
    }

    /// Header of the source file.
    pub fn header(&self) -> &ScanHeader {
        &self.header
    }

    /// Parameters in column order.
    pub fn parameters(&self) -> &[SParameter] {
        &self.header.acquisition.parameters
    }

    /// X axis (zero-relative, mm).
    pub fn x_axis(&self) -> &[f64] {
        &self.x
    }

    /// Y axis (zero-relative, mm).
    pub fn y_axis(&self) -> &[f64] {
        &self.y
    }

    /// Z axis (zero-relative, mm).
    pub fn z_axis(&self) -> &[f64] {
        &self.z
    }

    /// Frequency axis (Hz).
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Number of rows placed into the grid.
    pub fn rows_indexed(&self) -> usize {
        self.rows_indexed
    }

    fn offset(&self, q: Quantity, p: usize, f: usize, xi: usize, yi: usize, zi: usize) -> usize {
        let n_params = self.header.acquisition.parameters.len();
        ((((q as usize * n_params + p) * self.frequencies.len() + f) * self.x.len() + xi)
            * self.y.len()
            + yi)
            * self.z.len()
            + zi
    }

    /// Value at an index, `None` if out of range or never measured.
    pub fn get(
        &self,
        quantity: Quantity,
        param_index: usize,
        freq_index: usize,
        xi: usize,
        yi: usize,
        zi: usize,
    ) -> Option<f64> {
        if param_index >= self.parameters().len()
            || freq_index >= self.frequencies.len()
            || xi >= self.x.len()
            || yi >= self.y.len()
            || zi >= self.z.len()
        {
            return None;
        }
        let v = self.values[self.offset(quantity, param_index, freq_index, xi, yi, zi)];
        (!v.is_nan()).then_some(v)
    }

    /// Amplitude and phase of `parameter` at an index.
    pub fn sample(
        &self,
        parameter: SParameter,
        freq_index: usize,
        xi: usize,
        yi: usize,
        zi: usize,
    ) -> Option<(f64, f64)> {
        let p = self.parameters().iter().position(|q| *q == parameter)?;
        Some((
            self.get(Quantity::Amplitude, p, freq_index, xi, yi, zi)?,
            self.get(Quantity::Phase, p, freq_index, xi, yi, zi)?,
        ))
    }

    /// XY plane at one frequency and z index, as `[y][x]`.
    pub fn slice_xy(
        &self,
        quantity: Quantity,
        param_index: usize,
        freq_index: usize,
        zi: usize,
    ) -> Vec<Vec<Option<f64>>> {
        (0..self.y.len())
            .map(|yi| {
                (0..self.x.len())
                    .map(|xi| self.get(quantity, param_index, freq_index, xi, yi, zi))
                    .collect()
            })
            .collect()
    }

    /// Index of the frequency bin closest to `hz`.
    pub fn nearest_frequency(&self, hz: f64) -> usize {
        self.frequencies
            .iter()
            .enumerate()
            .min_by(|a, b| (a.1 - hz).abs().total_cmp(&(b.1 - hz).abs()))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}

fn off_axis(row: usize, axis: &str, value: f64) -> ScanError {
    ScanError::Format(format!("row {row}: {axis} = {value} is not on the header axis"))
}

/// Index of `value` on an evenly spaced axis, tolerating rounding noise.
fn axis_index(axis: &[f64], value: f64) -> Option<usize> {
    let first = *axis.first()?;
    if axis.len() == 1 {
        let tolerance = 1e-9 * first.abs().max(1.0);
        return ((value - first).abs() <= tolerance).then_some(0);
    }
    let step = (axis[axis.len() - 1] - first) / (axis.len() - 1) as f64;
    if step == 0.0 {
        return ((value - first).abs() <= 1e-9 * first.abs().max(1.0)).then_some(0);
    }
    let position = (value - first) / step;
    let index = position.round();
    if (position - index).abs() > 1e-3 || index < 0.0 || index >= axis.len() as f64 {
        return None;
    }
    Some(index as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::storage::{ResultAssembler, ScanHeader};
    use crate::experiment::acquisition::{AcquisitionTask, SampleRecord, TracePoint};
    use crate::experiment::mesh::{points, AxisRange, MeshConfig, Point3D, Traversal};
    use crate::metadata::RunMetadata;
    use std::time::Duration;

    fn build(parameters: Vec<SParameter>, traversal: Traversal, limit: Option<usize>) -> ScanResult {
        let mesh = MeshConfig::new(
            AxisRange::new(0.0, 20.0, 3),
            AxisRange::new(-5.0, 5.0, 2),
            AxisRange::new(0.0, 4.0, 2),
        )
        .with_traversal(traversal)
        .with_offset(Point3D::new(50.0, 50.0, 10.0));
        let zero = Point3D::new(60.0, 50.0, 10.0);
        let task = AcquisitionTask::new(parameters, 1e9, 3e9, 3).unwrap();
        let header = ScanHeader::new(RunMetadata::default(), &mesh, &task, zero, 1500.0);
        let mut asm = ResultAssembler::new(header);

        for (i, p) in points(&mesh).iter().enumerate().take(limit.unwrap_or(usize::MAX)) {
            let rel = p.relative_to(&zero);
            for (pi, parameter) in task.parameters.iter().enumerate() {
                for f in task.frequencies() {
                    asm.push(SampleRecord {
                        point_index: i,
                        position: rel,
                        frequency_hz: f,
                        parameter: *parameter,
                        amplitude: rel.x * 1000.0 + rel.y * 100.0 + rel.z * 10.0 + pi as f64,
                        phase_deg: f / 1e9,
                    })
                    .unwrap();
                }
            }
        }
        asm.finalize(Duration::from_secs(1), limit.is_none())
    }

    #[test]
    fn test_axes_rebuilt_from_header() {
        let ds = ScanDataset::from_result(build(vec![SParameter::S11], Traversal::AxisMajor, None))
            .unwrap();
        assert_eq!(ds.x_axis(), &[-10.0, 0.0, 10.0]);
        assert_eq!(ds.y_axis(), &[-5.0, 5.0]);
        assert_eq!(ds.z_axis(), &[0.0, 4.0]);
        assert_eq!(ds.frequencies(), &[1e9, 2e9, 3e9]);
        assert_eq!(ds.rows_indexed(), 12 * 3);
    }

    #[test]
    fn test_roundtrip_through_file_all_parameters() {
        for traversal in [Traversal::AxisMajor, Traversal::Snake] {
            let result = build(SParameter::ALL.to_vec(), traversal, None);
            let dir = tempfile::tempdir().unwrap();
            let path = result.write_to_dir(dir.path()).unwrap();
            let ds = ScanResultReader::load(&path).unwrap();

            for row in &result.rows {
                let xi = axis_index(ds.x_axis(), row[0]).unwrap();
                let yi = axis_index(ds.y_axis(), row[1]).unwrap();
                let zi = axis_index(ds.z_axis(), row[2]).unwrap();
                let fi = ds.nearest_frequency(row[3]);
                for (p, parameter) in SParameter::ALL.iter().enumerate() {
                    let expected = (row[4 + 2 * p], row[5 + 2 * p]);
                    assert_eq!(ds.sample(*parameter, fi, xi, yi, zi), Some(expected));
                }
            }
        }
    }

    #[test]
    fn test_single_parameter_offsets() {
        let ds = ScanDataset::from_result(build(vec![SParameter::S22], Traversal::AxisMajor, None))
            .unwrap();
        // x = 10, y = 5, z = 4
        assert_eq!(ds.get(Quantity::Amplitude, 0, 1, 2, 1, 1), Some(10_540.0));
        assert_eq!(ds.get(Quantity::Phase, 0, 1, 2, 1, 1), Some(2.0));
        assert_eq!(ds.sample(SParameter::S11, 0, 0, 0, 0), None);
        assert_eq!(ds.get(Quantity::Amplitude, 1, 0, 0, 0, 0), None);
    }

    #[test]
    fn test_partial_scan_leaves_gaps() {
        let ds = ScanDataset::from_result(build(
            vec![SParameter::S11, SParameter::S12],
            Traversal::AxisMajor,
            Some(2),
        ))
        .unwrap();
        assert!(ds.get(Quantity::Amplitude, 0, 0, 0, 0, 0).is_some());
        assert!(ds.get(Quantity::Amplitude, 0, 0, 1, 0, 0).is_some());
        assert!(ds.get(Quantity::Amplitude, 0, 0, 2, 0, 0).is_none());
        let plane = ds.slice_xy(Quantity::Amplitude, 1, 0, 0);
        assert_eq!(plane.len(), 2);
        assert_eq!(plane[0][0], Some(-10_000.0 - 500.0 + 1.0));
        assert_eq!(plane[1][0], None);
        assert!(!ds.header().complete);
    }

    #[test]
    fn test_rejects_malformed_rows() {
        let mut result = build(vec![SParameter::S11], Traversal::AxisMajor, Some(1));
        result.rows[0].push(0.0);
        assert!(matches!(
            ScanDataset::from_result(result),
            Err(ScanError::Format(_))
        ));

        let mut result = build(vec![SParameter::S11], Traversal::AxisMajor, Some(1));
        result.rows[0][0] = 3.0;
        let err = ScanDataset::from_result(result).unwrap_err();
        assert!(err.to_string().contains("x = 3"));
    }

    #[test]
    fn test_trace_derived_values_survive_file() {
        let mesh = MeshConfig::new(
            AxisRange::new(-7.3, 11.9, 4),
            AxisRange::fixed(0.0),
            AxisRange::fixed(0.0),
        );
        let task = AcquisitionTask::new(vec![SParameter::S12], 8.2e9, 12.4e9, 7).unwrap();
        let zero = Point3D::new(0.1, 0.2, 0.3);
        let header = ScanHeader::new(RunMetadata::default(), &mesh, &task, zero, 1500.0);
        let mut asm = ResultAssembler::new(header);
        for (i, p) in points(&mesh).iter().enumerate() {
            for (k, f) in task.frequencies().into_iter().enumerate() {
                let re = (f / 1e9 + i as f64).sin() / 3.0;
                let im = -(k as f64 + 0.7).cos() / 7.0;
                let bin = TracePoint::new(f, re, im);
                asm.push(SampleRecord::from_trace(i, p.relative_to(&zero), SParameter::S12, &bin))
                    .unwrap();
            }
        }
        let result = asm.finalize(Duration::from_millis(1234), true);

        let dir = tempfile::tempdir().unwrap();
        let path = result.write_to_dir(dir.path()).unwrap();
        let ds = ScanResultReader::load(&path).unwrap();

        assert_eq!(ds.rows_indexed(), 4 * 7);
        for row in &result.rows {
            let xi = axis_index(ds.x_axis(), row[0]).unwrap();
            let fi = ds.nearest_frequency(row[3]);
            assert_eq!(
                ds.sample(SParameter::S12, fi, xi, 0, 0),
                Some((row[4], row[5])),
                "row {row:?}"
            );
        }
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut result = build(vec![SParameter::S11], Traversal::AxisMajor, Some(1));
        result.header.x.steps = usize::MAX / 2;
        result.header.y.steps = 3;
        let err = ScanDataset::from_result(result).unwrap_err();
        assert!(matches!(err, ScanError::Format(_)));

        let mut result = build(vec![SParameter::S11], Traversal::AxisMajor, Some(1));
        result.header.acquisition.points = 1 << 20;
        result.header.z.steps = 1 << 12;
        assert!(ScanDataset::from_result(result).is_err());
    }

    #[test]
    fn test_axis_index_tolerates_noise() {
        let axis = linspace(0.0, 1.0, 11);
        assert_eq!(axis_index(&axis, 0.30000000000000004), Some(3));
        assert_eq!(axis_index(&axis, 0.35), None);
        assert_eq!(axis_index(&axis, 1.1), None);
        assert_eq!(axis_index(&[2.0], 2.0), Some(0));
    }
}
