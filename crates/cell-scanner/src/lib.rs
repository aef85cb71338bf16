//! Barcode scanner access for the marking cell.
//!
//! This crate provides:
//! - [`ScannerPort`] trait the cycle reads through
//! - [`client`] module with the persistent TCP client
//! - [`audit`] module with the CSV log of raw readings
//! - [`ScriptedScanner`] canned readings for tests and dry runs
//!
//! The scanner is triggered by a PLC bit, never by this crate. A reading is
//! one line, or two lines concatenated without a separator. A first line of
//! `0` means "no read" and becomes [`NG`].

pub mod audit;
pub mod client;

pub use audit::AuditLog;
pub use client::{ScannerClient, NO_READ_GRACE};

use async_trait::async_trait;
use cell_common::{CellError, CellResult, NG};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;

/// Scanner-level failures.
#[derive(Debug, Error)]
pub enum ScannerError {
    /// Connect did not finish in time.
    #[error("connection to {0} timed out")]
    ConnectTimeout(String),

    /// The scanner closed the socket.
    #[error("scanner closed the connection")]
    Closed,

    /// No line arrived within the configured read timeout.
    #[error("no reading within {0:?}")]
    ReadTimeout(std::time::Duration),

    /// Socket error.
    #[error("scanner I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ScannerError> for CellError {
    fn from(err: ScannerError) -> Self {
        CellError::Transport(err.to_string())
    }
}

/// Source of scanner readings.
#[async_trait]
pub trait ScannerPort: Send + Sync {
    /// Open the connection. Calling it on an open connection is a no-op.
    async fn connect(&self) -> CellResult<()> {
        Ok(())
    }

    /// Block for one reading.
    ///
    /// Returns [`NG`] for a no-read. With `expect_second_line` a real first
    /// line is followed by a second one and both are concatenated.
    async fn get_reading(&self, expect_second_line: bool) -> CellResult<String>;

    /// Drop the connection so the next call reconnects.
    async fn invalidate(&self) {}

    /// Close the connection for good.
    async fn close(&self) {}
}

/// Returns true when a first line is the scanner's "no read" answer.
#[must_use]
pub fn is_no_read(line: &str) -> bool {
    matches!(line.trim(), "0" | "0\r\n0")
}

/// Map a raw first line to the value the cycle works with.
#[must_use]
pub fn normalize(line: &str) -> String {
    if is_no_read(line) {
        NG.to_string()
    } else {
        line.trim().to_string()
    }
}

/// Scanner double that replays queued readings.
///
/// Cloning shares the queue. When the queue runs dry the fallback reading
/// (default [`NG`]) is returned.
#[derive(Debug, Clone)]
pub struct ScriptedScanner {
    inner: Arc<Mutex<Script>>,
}

#[derive(Debug)]
struct Script {
    queue: VecDeque<CellResult<String>>,
    fallback: String,
    calls: Vec<bool>,
    call_times: Vec<Instant>,
}

impl Default for ScriptedScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedScanner {
    /// Empty script answering [`NG`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Script {
                queue: VecDeque::new(),
                fallback: NG.to_string(),
                calls: Vec::new(),
                call_times: Vec::new(),
            })),
        }
    }

    /// Script pre-loaded with readings.
    #[must_use]
    pub fn with_readings(readings: &[&str]) -> Self {
        let scanner = Self::new();
        for reading in readings {
            scanner.push_reading(reading);
        }
        scanner
    }

    /// Queue a reading; raw no-read lines are normalized like the real client.
    pub fn push_reading(&self, reading: &str) {
        self.inner.lock().queue.push_back(Ok(normalize(reading)));
    }

    /// Queue a failure.
    pub fn push_error(&self, err: CellError) {
        self.inner.lock().queue.push_back(Err(err));
    }

    /// Reading returned once the queue is empty.
    pub fn set_fallback(&self, reading: &str) {
        self.inner.lock().fallback = normalize(reading);
    }

    /// `expect_second_line` of every call so far.
    #[must_use]
    pub fn calls(&self) -> Vec<bool> {
        self.inner.lock().calls.clone()
    }

    /// When each call was made, on the tokio clock.
    #[must_use]
    pub fn call_times(&self) -> Vec<Instant> {
        self.inner.lock().call_times.clone()
    }

    /// Readings still queued.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

#[async_trait]
impl ScannerPort for ScriptedScanner {
    async fn get_reading(&self, expect_second_line: bool) -> CellResult<String> {
        let mut script = self.inner.lock();
        script.calls.push(expect_second_line);
        script.call_times.push(Instant::now());
        match script.queue.pop_front() {
            Some(next) => next,
            None => Ok(script.fallback.clone()),
        }
    }
}
