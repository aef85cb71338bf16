//! Durable CSV log of every scanner reading.

use cell_common::{CellError, CellResult};
use chrono::{DateTime, Local};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

const HEADER: [&str; 3] = ["Timestamp", "First Data", "Second Data"];
const TIMESTAMP_FORMAT: &str = "%d/%m/%y %H:%M:%S";

/// Append-only `timestamp,line1,line2` log.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// Log at `path`; the file and its header are created on first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Log file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the file cannot be opened or written.
    pub fn append(&self, timestamp: DateTime<Local>, first: &str, second: &str) -> CellResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let is_new = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        let stamp = timestamp.format(TIMESTAMP_FORMAT).to_string();
        write_row(&mut writer, is_new, [stamp.as_str(), first, second])
            .map_err(|e| CellError::Io(format!("{}: {e}", self.path.display())))
    }
}

fn write_row(writer: &mut csv::Writer<File>, is_new: bool, row: [&str; 3]) -> csv::Result<()> {
    if is_new {
        writer.write_record(HEADER)?;
    }
    writer.write_record(row)?;
    writer.flush()?;
    Ok(())
}
