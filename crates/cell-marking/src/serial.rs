//! Four-digit serial number counter.
//!
//! The counter issues `0000`..`9998`. Reaching [`SERIAL_LIMIT`] wraps back to
//! the configured initial value. Before issuing, the counter catches up with
//! the latest persisted record written after today's reset time, so a
//! restarted process continues where the previous one stopped.
//!
//! # Example
//!
//! ```
//! use cell_marking::serial::SerialCounter;
//! use chrono::{Local, NaiveTime, TimeZone};
//!
//! let reset = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
//! let now = Local.with_ymd_and_hms(2024, 6, 15, 9, 0, 0).unwrap();
//! let mut counter = SerialCounter::new(1, reset);
//!
//! assert_eq!(counter.next_serial(now, None), "0001");
//! assert_eq!(counter.next_serial(now, None), "0002");
//!
//! // A reset that cancels the cycle gives the number back.
//! counter.compensate();
//! assert_eq!(counter.next_serial(now, None), "0002");
//! ```

use cell_common::config::{SerialConfig, SERIAL_LIMIT};
use cell_common::{reset_time_today, CellError, CellResult, MarkingRecord};
use chrono::{DateTime, Local, NaiveTime};
use tracing::{info, warn};

/// Width of a formatted serial.
pub const SERIAL_WIDTH: usize = 4;

/// Format a counter value as a zero-padded serial.
#[must_use]
pub fn format_serial(value: u32) -> String {
    format!("{value:0width$}", width = SERIAL_WIDTH)
}

/// Process-wide serial number state, owned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialCounter {
    current: u32,
    initial: u32,
    reset_time: NaiveTime,
    last_reset: Option<DateTime<Local>>,
    manual_reset_pending: bool,
}

impl SerialCounter {
    /// Counter starting at `initial`.
    #[must_use]
    pub fn new(initial: u32, reset_time: NaiveTime) -> Self {
        Self {
            current: initial,
            initial,
            reset_time,
            last_reset: None,
            manual_reset_pending: false,
        }
    }

    /// Counter built from the `[serial]` section.
    #[must_use]
    pub fn from_config(config: &SerialConfig) -> Self {
        Self::new(config.initial, config.reset_time)
    }

    /// Value the next issuance will use (before any catch-up).
    #[must_use]
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Wraparound target.
    #[must_use]
    pub fn initial(&self) -> u32 {
        self.initial
    }

    /// Daily reset time.
    #[must_use]
    pub fn reset_time(&self) -> NaiveTime {
        self.reset_time
    }

    /// Time of the last wraparound, manual reset, or catch-up.
    #[must_use]
    pub fn last_reset(&self) -> Option<DateTime<Local>> {
        self.last_reset
    }

    /// Whether the next issuance bypasses catch-up.
    #[must_use]
    pub fn manual_reset_pending(&self) -> bool {
        self.manual_reset_pending
    }

    /// Resume from the latest persisted record at startup.
    pub fn restore(&mut self, latest: Option<&MarkingRecord>, now: DateTime<Local>) {
        if let Some(record) = latest {
            match parse_serial(&record.serial_number) {
                Some(serial) => {
                    self.current = serial + 1;
                    self.last_reset = Some(record.timestamp);
                    info!(current = self.current, "Serial counter restored from latest record");
                }
                None => warn!(serial = %record.serial_number, "Latest record has no numeric serial"),
            }
        }
        self.wrap(now);
    }

    /// Issue the next serial.
    ///
    /// `latest` is the most recent persisted record; it is ignored when a
    /// manual reset is pending or the counter just wrapped.
    pub fn next_serial(&mut self, now: DateTime<Local>, latest: Option<&MarkingRecord>) -> String {
        let wrapped = self.wrap(now);

        if self.manual_reset_pending {
            self.manual_reset_pending = false;
            return self.issue();
        }

        if !wrapped {
            if let Some(record) = latest {
                if record.timestamp > reset_time_today(now, self.reset_time) {
                    if let Some(serial) = parse_serial(&record.serial_number) {
                        self.current = serial + 1;
                        self.last_reset = Some(record.timestamp);
                    }
                }
            }
            self.wrap(now);
        }

        self.issue()
    }

    /// Give back the number of an issuance that will not happen.
    ///
    /// Returns false when skipped because a manual reset is pending.
    pub fn compensate(&mut self) -> bool {
        if self.manual_reset_pending {
            return false;
        }
        self.current = self.current.saturating_sub(1);
        true
    }

    /// Operator reset: the next issuance returns exactly `value`.
    ///
    /// # Errors
    ///
    /// [`CellError::Config`] when `value` is not a valid serial.
    pub fn manual_reset(&mut self, value: u32, now: DateTime<Local>) -> CellResult<()> {
        check_range(value)?;
        self.current = value;
        self.last_reset = Some(now);
        self.manual_reset_pending = true;
        info!(serial = %format_serial(value), "Serial number manually reset");
        Ok(())
    }

    /// Change the daily reset time.
    pub fn set_reset_time(&mut self, reset_time: NaiveTime) {
        self.reset_time = reset_time;
        info!(%reset_time, "Serial reset time updated");
    }

    /// Change the wraparound target.
    ///
    /// # Errors
    ///
    /// [`CellError::Config`] when `value` is not a valid serial.
    pub fn set_initial(&mut self, value: u32) -> CellResult<()> {
        check_range(value)?;
        self.initial = value;
        info!(initial = value, "Initial serial updated");
        Ok(())
    }

    fn wrap(&mut self, now: DateTime<Local>) -> bool {
        if self.current < SERIAL_LIMIT {
            return false;
        }
        self.current = self.initial;
        self.last_reset = Some(now);
        info!(serial = %format_serial(self.initial), "Serial number wrapped");
        true
    }

    fn issue(&mut self) -> String {
        let serial = format_serial(self.current);
        self.current += 1;
        serial
    }
}

fn parse_serial(serial: &str) -> Option<u32> {
    serial.trim().parse().ok()
}

fn check_range(value: u32) -> CellResult<()> {
    if value < SERIAL_LIMIT {
        Ok(())
    } else {
        Err(CellError::Config(format!(
            "serial value {value} outside 0..={}",
            SERIAL_LIMIT - 1
        )))
    }
}
