//! Notifications published by the orchestrator and monitor.
//!
//! Delivery is fire-and-forget over a broadcast channel; a send with no
//! subscribers is not an error.

use crate::address::RegisterAddress;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default broadcast capacity.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum CellEvent {
    /// Barcode text handed to the marking controller.
    #[serde(rename = "marking_data")]
    MarkingData {
        /// Barcode text.
        data: String,
    },
    /// A scanner reading was taken.
    #[serde(rename = "scanner_read")]
    ScannerRead {
        /// `"first"` or `"second"`.
        scanner_type: String,
        /// Normalized reading.
        data: String,
    },
    /// The first scan found an already-marked part.
    #[serde(rename = "first_scan_ok")]
    FirstScanOk {
        /// Reading that was accepted.
        scanner_data: String,
        /// Operator message.
        message: String,
    },
    /// A monitored alarm bit is set.
    #[serde(rename = "alarm")]
    Alarm {
        /// Alarm name, e.g. `part-present`.
        name: String,
        /// Flag that raised it.
        address: RegisterAddress,
        /// Operator message.
        message: String,
    },
    /// The camera image for a part could not be archived.
    #[serde(rename = "image_save_error")]
    ImageSaveError {
        /// Operator message.
        message: String,
        /// Directory searched.
        path: String,
    },
    /// Result of a manual serial reset.
    #[serde(rename = "resetComplete")]
    ResetComplete {
        /// Whether the reset was applied.
        success: bool,
        /// Requested value.
        reset_value: u32,
        /// Counter value after the command.
        current_value: u32,
        /// Rejection reason, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Result of a reset-time update.
    #[serde(rename = "resetTimeComplete")]
    ResetTimeComplete {
        /// Whether the update was applied.
        success: bool,
        /// Requested hour.
        hour: u32,
        /// Requested minute.
        minute: u32,
        /// Human-readable outcome.
        message: String,
    },
}

impl CellEvent {
    /// Name under which subscribers receive this event.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::MarkingData { .. } => "marking_data",
            Self::ScannerRead { .. } => "scanner_read",
            Self::FirstScanOk { .. } => "first_scan_ok",
            Self::Alarm { name, .. } => name,
            Self::ImageSaveError { .. } => "image_save_error",
            Self::ResetComplete { .. } => "resetComplete",
            Self::ResetTimeComplete { .. } => "resetTimeComplete",
        }
    }
}

/// An event with its emission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedEvent {
    /// Emission time.
    pub timestamp: DateTime<Local>,
    /// Payload.
    #[serde(flatten)]
    pub event: CellEvent,
}

/// Broadcast sink for [`CellEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TimestampedEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Never blocks, never fails.
    pub fn emit(&self, event: CellEvent) {
        let _ = self.tx.send(TimestampedEvent {
            timestamp: Local::now(),
            event,
        });
    }

    /// Subscribe to events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TimestampedEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(CellEvent::MarkingData {
            data: "240615XX0007".into(),
        });
    }

    #[test]
    fn test_subscriber_receives_event() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.emit(CellEvent::FirstScanOk {
            scanner_data: "ABC".into(),
            message: "part already marked".into(),
        });
        let received = rx.try_recv().unwrap();
        assert_eq!(received.event.name(), "first_scan_ok");
    }

    #[test]
    fn test_alarm_name_and_json_shape() {
        let event = CellEvent::Alarm {
            name: "safety-curtain".into(),
            address: RegisterAddress::new(1490, 2),
            message: "Safety curtain error".into(),
        };
        assert_eq!(event.name(), "safety-curtain");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "alarm");
        assert_eq!(json["address"], "1490.2");
    }
}
