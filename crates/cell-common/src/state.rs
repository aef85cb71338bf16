//! Scan-cycle state machine.
//!
//! One iteration walks
//! AWAIT_START → FIRST_SCAN → GENERATE_BARCODE → AWAIT_TRANSFER_ACK → SECOND_SCAN → FINALIZE
//! and any state may fall back to AWAIT_START when the iteration ends.

use crate::error::{CellError, CellResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Steps of one scan cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleState {
    /// Waiting for the PLC start bit.
    #[default]
    AwaitStart,
    /// Checking whether the part is already marked.
    FirstScan,
    /// Issuing the serial and writing hand-off files.
    GenerateBarcode,
    /// Waiting for the PLC to confirm the marking controller took the files.
    AwaitTransferAck,
    /// Verifying the mark.
    SecondScan,
    /// Waiting for the final PLC acknowledgement.
    Finalize,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitStart => write!(f, "AWAIT_START"),
            Self::FirstScan => write!(f, "FIRST_SCAN"),
            Self::GenerateBarcode => write!(f, "GENERATE_BARCODE"),
            Self::AwaitTransferAck => write!(f, "AWAIT_TRANSFER_ACK"),
            Self::SecondScan => write!(f, "SECOND_SCAN"),
            Self::Finalize => write!(f, "FINALIZE"),
        }
    }
}

impl CycleState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: CycleState) -> bool {
        use CycleState::{
            AwaitStart, AwaitTransferAck, Finalize, FirstScan, GenerateBarcode, SecondScan,
        };

        matches!(
            (self, target),
            (AwaitStart, FirstScan)
                | (FirstScan, GenerateBarcode)
                | (GenerateBarcode, AwaitTransferAck)
                | (AwaitTransferAck, SecondScan)
                | (SecondScan, Finalize)
                // Every iteration ends back at the start
                | (_, AwaitStart)
        )
    }

    /// Returns true once a serial has been issued for this iteration.
    #[must_use]
    pub fn has_marking(&self) -> bool {
        matches!(
            self,
            Self::AwaitTransferAck | Self::SecondScan | Self::Finalize
        )
    }
}

/// How an iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleOutcome {
    /// Part marked, verified, and acknowledged.
    Completed,
    /// Interrupted by the reset coil.
    AbortedReset,
    /// First scan found an already-marked part.
    AbortedOkPart,
    /// A bounded PLC wait expired.
    AbortedTimeout,
    /// Hand-off files could not be verified.
    AbortedVerification,
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "COMPLETED"),
            Self::AbortedReset => write!(f, "ABORTED_RESET"),
            Self::AbortedOkPart => write!(f, "ABORTED_OK_PART"),
            Self::AbortedTimeout => write!(f, "ABORTED_TIMEOUT"),
            Self::AbortedVerification => write!(f, "ABORTED_VERIFICATION"),
        }
    }
}

/// State machine wrapper with transition history tracking.
#[derive(Debug, Clone, Default)]
pub struct CycleStateMachine {
    current: CycleState,
    previous: Option<CycleState>,
    transition_count: u64,
}

impl CycleStateMachine {
    /// Create a new state machine starting in AWAIT_START.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> CycleState {
        self.current
    }

    /// Get the previous state (if any transition occurred).
    #[must_use]
    pub fn previous_state(&self) -> Option<CycleState> {
        self.previous
    }

    /// Get total number of transitions.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt a state transition.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::InvalidStateTransition`] for transitions outside the cycle order.
    pub fn transition(&mut self, target: CycleState) -> CellResult<()> {
        if self.current.can_transition_to(target) {
            self.previous = Some(self.current);
            self.current = target;
            self.transition_count += 1;
            Ok(())
        } else {
            Err(CellError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Return to AWAIT_START (always valid).
    pub fn restart(&mut self) {
        if self.current != CycleState::AwaitStart {
            self.previous = Some(self.current);
            self.current = CycleState::AwaitStart;
            self.transition_count += 1;
        }
    }
}
