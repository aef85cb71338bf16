//! Persisted outcome of one marked part.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Placeholder for scanner data and grade before the second scan completes.
pub const NOT_AVAILABLE: &str = "N/A";

/// Sentinel reading meaning "no valid read".
pub const NG: &str = "NG";

/// Verdict stored with each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RecordResult {
    /// Data matched and grade accepted.
    #[serde(rename = "OK")]
    Ok,
    /// Mismatch, rejected grade, no read, or aborted after marking.
    #[serde(rename = "NG")]
    Ng,
    /// Marking attempted, verdict pending.
    #[default]
    #[serde(rename = "N/A")]
    NotAvailable,
}

impl fmt::Display for RecordResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Ng => write!(f, "NG"),
            Self::NotAvailable => write!(f, "N/A"),
        }
    }
}

/// One row of the results store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkingRecord {
    /// Time of the last write to this row.
    pub timestamp: DateTime<Local>,
    /// Four-digit serial issued for the part.
    pub serial_number: String,
    /// Barcode text written to the marking controller.
    pub marking_data: String,
    /// Verification scan reading.
    pub scanner_data: String,
    /// Verdict.
    pub result: RecordResult,
    /// Upper-case grade letter, `F` for no read, `N/A` while pending.
    pub grade: String,
    /// Per-day sequence number.
    pub day_id: u32,
    /// Active part number at marking time.
    #[serde(default)]
    pub part_number: String,
    /// Free-form note ("Image not found", ...).
    #[serde(default)]
    pub remark: String,
}

impl MarkingRecord {
    /// Row written right after the marking files are verified.
    #[must_use]
    pub fn pending(
        timestamp: DateTime<Local>,
        serial_number: &str,
        marking_data: &str,
        day_id: u32,
        part_number: &str,
    ) -> Self {
        Self {
            timestamp,
            serial_number: serial_number.to_string(),
            marking_data: marking_data.to_string(),
            scanner_data: NOT_AVAILABLE.to_string(),
            result: RecordResult::NotAvailable,
            grade: NOT_AVAILABLE.to_string(),
            day_id,
            part_number: part_number.to_string(),
            remark: String::new(),
        }
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, patch: &RecordPatch) {
        self.timestamp = patch.timestamp;
        if let Some(scanner_data) = &patch.scanner_data {
            self.scanner_data.clone_from(scanner_data);
        }
        if let Some(result) = patch.result {
            self.result = result;
        }
        if let Some(grade) = &patch.grade {
            self.grade = grade.to_uppercase();
        }
        if let Some(remark) = &patch.remark {
            self.remark.clone_from(remark);
        }
    }
}

/// Fields changed by an update of the latest row for a serial.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordPatch {
    /// New row timestamp.
    pub timestamp: DateTime<Local>,
    /// Replacement scanner data.
    pub scanner_data: Option<String>,
    /// Replacement verdict.
    pub result: Option<RecordResult>,
    /// Replacement grade (stored upper-case).
    pub grade: Option<String>,
    /// Replacement remark.
    pub remark: Option<String>,
}

impl RecordPatch {
    /// Empty patch that only refreshes the timestamp.
    #[must_use]
    pub fn at(timestamp: DateTime<Local>) -> Self {
        Self {
            timestamp,
            scanner_data: None,
            result: None,
            grade: None,
            remark: None,
        }
    }

    /// Patch used when a cycle aborts after marking.
    #[must_use]
    pub fn aborted(timestamp: DateTime<Local>) -> Self {
        Self {
            scanner_data: Some(NOT_AVAILABLE.to_string()),
            result: Some(RecordResult::Ng),
            ..Self::at(timestamp)
        }
    }
}
