//! Per-day record numbering, reset at the serial reset time.

use cell_common::{last_reset_boundary, MarkingRecord};
use chrono::{DateTime, Duration, Local, NaiveTime};
use tracing::info;

/// Day id counter. The first record after each reset boundary gets 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayIdCounter {
    last_issued: u32,
    reset_time: NaiveTime,
    last_reset: DateTime<Local>,
}

impl DayIdCounter {
    /// Fresh counter for the day containing `now`.
    #[must_use]
    pub fn new(reset_time: NaiveTime, now: DateTime<Local>) -> Self {
        Self {
            last_issued: 0,
            reset_time,
            last_reset: last_reset_boundary(now, reset_time),
        }
    }

    /// Continue numbering from `latest` if it belongs to the current day.
    pub fn resume(&mut self, latest: Option<&MarkingRecord>, now: DateTime<Local>) {
        self.last_reset = last_reset_boundary(now, self.reset_time);
        if let Some(record) = latest {
            if record.timestamp >= self.last_reset {
                self.last_issued = record.day_id;
                info!(day_id = record.day_id, "Day id resumed from latest record");
            }
        }
    }

    /// Issue the id for a new record.
    pub fn next(&mut self, now: DateTime<Local>) -> u32 {
        if now >= self.last_reset + Duration::days(1) {
            self.last_issued = 0;
            self.last_reset = last_reset_boundary(now, self.reset_time);
        }
        self.last_issued += 1;
        self.last_issued
    }

    /// Change the reset time; the boundary is recomputed from `now`.
    pub fn set_reset_time(&mut self, reset_time: NaiveTime, now: DateTime<Local>) {
        self.reset_time = reset_time;
        self.last_reset = last_reset_boundary(now, reset_time);
    }

    /// Last id handed out (0 before the first record of the day).
    #[must_use]
    pub fn last_issued(&self) -> u32 {
        self.last_issued
    }
}
