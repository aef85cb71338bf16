//! Settings documents read from the store: shift table, grade policy,
//! and the barcode field template.

use crate::error::{CellError, CellResult};
use crate::time::hhmm;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

/// Label returned when no shift window covers a time.
pub const UNKNOWN_SHIFT: &str = "Unknown";

/// One named shift window. `end` may be earlier than `start` for overnight shifts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftWindow {
    /// Shift label, e.g. `"A"`.
    pub label: String,
    /// Inclusive start.
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    /// Exclusive end.
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl ShiftWindow {
    /// Whether `time` falls inside this window.
    #[must_use]
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start == self.end {
            // A single shift spanning the whole day.
            return true;
        }
        if self.start < self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// Ordered shift windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftTable {
    /// Windows checked in order; first match wins.
    pub shifts: Vec<ShiftWindow>,
}

impl Default for ShiftTable {
    fn default() -> Self {
        Self::chain(&[("A", hm(6, 0)), ("B", hm(14, 30)), ("C", hm(23, 0))])
    }
}

impl ShiftTable {
    /// Build windows from start times. Shifts are sorted by start; each
    /// ends where the next begins and the last wraps to the first.
    ///
    /// # Errors
    ///
    /// [`CellError::Config`] when two shifts start at the same time.
    pub fn from_starts(starts: &[(&str, NaiveTime)]) -> CellResult<Self> {
        let mut sorted = starts.to_vec();
        sorted.sort_by_key(|(_, start)| *start);
        if let Some(pair) = sorted.windows(2).find(|pair| pair[0].1 == pair[1].1) {
            return Err(CellError::Config(format!(
                "shifts {} and {} both start at {}",
                pair[0].0,
                pair[1].0,
                pair[0].1.format("%H:%M")
            )));
        }
        Ok(Self::chain(&sorted))
    }

    fn chain(starts: &[(&str, NaiveTime)]) -> Self {
        let shifts = starts
            .iter()
            .enumerate()
            .map(|(i, (label, start))| ShiftWindow {
                label: (*label).to_string(),
                start: *start,
                end: starts[(i + 1) % starts.len()].1,
            })
            .collect();
        Self { shifts }
    }

    /// Label of the shift covering `time`, or [`UNKNOWN_SHIFT`].
    #[must_use]
    pub fn shift_at(&self, time: NaiveTime) -> &str {
        self.shifts
            .iter()
            .find(|w| w.contains(time))
            .map_or(UNKNOWN_SHIFT, |w| w.label.as_str())
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

/// Grade acceptance: a cutoff letter `L` accepts every grade from `A` to `L`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradePolicy {
    /// Worst acceptable grade letter.
    pub cutoff: String,
}

impl Default for GradePolicy {
    fn default() -> Self {
        Self {
            cutoff: "B".to_string(),
        }
    }
}

impl GradePolicy {
    /// Policy with the given cutoff letter.
    #[must_use]
    pub fn new(cutoff: &str) -> Self {
        Self {
            cutoff: cutoff.to_string(),
        }
    }

    /// Whether `grade` is acceptable. Anything that is not a single
    /// letter, or a policy with an invalid cutoff, rejects.
    #[must_use]
    pub fn accepts(&self, grade: &str) -> bool {
        let Some(cutoff) = single_letter(&self.cutoff) else {
            return false;
        };
        single_letter(grade).is_some_and(|g| ('A'..=cutoff).contains(&g))
    }

    /// Letters accepted by this policy.
    #[must_use]
    pub fn accepted(&self) -> Vec<char> {
        single_letter(&self.cutoff)
            .map(|c| ('A'..=c).collect())
            .unwrap_or_default()
    }
}

fn single_letter(s: &str) -> Option<char> {
    let mut chars = s.trim().chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Some(c.to_ascii_uppercase()),
        _ => None,
    }
}

/// One configurable slot of the barcode template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateField {
    /// Slot name (`"Year"`, `"Serial Number"`, or any static label).
    pub name: String,
    /// Position; ascending.
    pub order: i32,
    /// Whether the slot is part of the barcode.
    #[serde(default)]
    pub checked: bool,
    /// Static value for slots that are not computed.
    #[serde(default)]
    pub value: Option<String>,
}

impl TemplateField {
    /// Checked field with no static value.
    #[must_use]
    pub fn checked(name: &str, order: i32) -> Self {
        Self {
            name: name.to_string(),
            order,
            checked: true,
            value: None,
        }
    }

    /// Checked field with a fixed value.
    #[must_use]
    pub fn fixed(name: &str, order: i32, value: &str) -> Self {
        Self {
            value: Some(value.to_string()),
            ..Self::checked(name, order)
        }
    }

    /// Unchecked field.
    #[must_use]
    pub fn unchecked(name: &str, order: i32) -> Self {
        Self {
            checked: false,
            ..Self::checked(name, order)
        }
    }
}

/// The active barcode template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldTemplate {
    /// Declared slots.
    pub fields: Vec<TemplateField>,
}

impl Default for FieldTemplate {
    fn default() -> Self {
        Self {
            fields: vec![
                TemplateField::checked("Year", 1),
                TemplateField::checked("Month", 2),
                TemplateField::checked("Date", 3),
                TemplateField::fixed("Supplier Code", 4, "XX"),
                TemplateField::checked("Serial Number", 5),
                TemplateField::unchecked("Julian Date", 6),
                TemplateField::unchecked("Shift", 7),
                TemplateField::unchecked("Model Number", 8),
            ],
        }
    }
}
