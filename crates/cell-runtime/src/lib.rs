#![doc = "Scan-cycle engine of the laser-marking cell."]

pub mod handoff;
pub mod images;
pub mod monitor;
pub mod orchestrator;
pub mod store;
pub mod wait;

pub use handoff::HandoffFiles;
pub use images::{ImageArchive, ImageOutcome};
pub use monitor::{AlarmPoller, Monitor, ResetPoller};
pub use orchestrator::*;
pub use store::{open_with_retry, CellStore, MemoryStore, RedbStore};
pub use wait::{ResetListener, ResetSignal, WaitOutcome, RESET_CHANNEL_CAPACITY};

use cell_common::{CellError, CellResult};

/// Run file system work on the blocking pool.
pub(crate) async fn blocking_fs<T, F>(op: F) -> CellResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CellResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| CellError::Io(format!("file task failed: {e}")))?
}
