//! Durable, append-only record of generic faults.
//!
//! One line per fault:
//!
//! ```text
//! 2026-03-01T14:02:11.204+01:00	point=17	(12.000, -4.000, 30.000)	motion: limit switch
//! ```
//!
//! Each entry is flushed to disk before the run engine backs off, so the record
//! survives the process being killed while a point is stuck retrying.

use std::path::{Path, PathBuf};

use chrono::{Local, SecondsFormat};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::AppResult;
use crate::experiment::mesh::Point3D;

/// Append-only fault log. Without a path, entries only go to `tracing`.
#[derive(Debug, Clone, Default)]
pub struct FaultJournal {
    path: Option<PathBuf>,
}

impl FaultJournal {
    /// Journal writing to `path`. The file is created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Journal that only logs.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record a fault at `point_index`.
    pub async fn append(&self, point_index: usize, position: Point3D, detail: &str) -> AppResult<()> {
        warn!(point_index, %position, detail, "Fault recorded");
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let line = format!(
            "{}\tpoint={}\t{}\t{}\n",
            Local::now().to_rfc3339_opts(SecondsFormat::Millis, false),
            point_index,
            position,
            detail.replace(['\n', '\t'], " "),
        );
        let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn test_entries_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("faults.log");
        let journal = FaultJournal::new(&path);

        journal
            .append(3, Point3D::new(1.0, 2.0, 3.0), "motion: stalled")
            .await
            .unwrap();
        journal
            .append(3, Point3D::new(1.0, 2.0, 3.0), "line one\nline two")
            .await
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let fields: Vec<_> = lines[0].split('\t').collect();
        assert_eq!(fields.len(), 4);
        assert!(chrono::DateTime::parse_from_rfc3339(fields[0]).is_ok());
        assert_eq!(fields[1], "point=3");
        assert_eq!(fields[2], "(1.000, 2.000, 3.000)");
        assert_eq!(fields[3], "motion: stalled");
        assert!(lines[1].ends_with("line one line two"));
        assert!(logs_contain("Fault recorded"));
        assert!(logs_contain("point_index=3"));
    }

    #[tokio::test]
    async fn test_disabled_journal_writes_nothing() {
        let journal = FaultJournal::disabled();
        assert!(journal.path().is_none());
        journal
            .append(0, Point3D::default(), "ignored")
            .await
            .unwrap();
    }
}
