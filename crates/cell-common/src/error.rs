use crate::address::RegisterAddress;
use std::time::Duration;
use thiserror::Error;

/// Cell error types covering transport failures, cycle control flow, and local recovery.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CellError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// PLC or scanner unreachable, or a protocol exchange failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A PLC write did not confirm within its deadline. PLC state is undefined.
    #[error("write to {address} did not complete within {timeout:?}")]
    WriteTimeout {
        /// Target flag or register.
        address: RegisterAddress,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// Hand-off file read-back did not match after all rewrites.
    #[error("verification failed for {path}")]
    VerificationFailure {
        /// File that failed verification.
        path: String,
    },

    /// Reset signal observed; unwinds the current cycle.
    #[error("reset detected")]
    ResetDetected,

    /// A bounded PLC wait expired.
    #[error("timed out after {after:?} in {step}")]
    StepTimeout {
        /// Cycle step that was waiting.
        step: String,
        /// Elapsed bound.
        after: Duration,
    },

    /// Grade outside the acceptance policy.
    #[error("grade {grade} rejected")]
    GradeRejected {
        /// Offending grade letter.
        grade: String,
    },

    /// No camera image matched the marking text.
    #[error("no image matching {pattern}")]
    ImageNotFound {
        /// Text searched for in file names.
        pattern: String,
    },

    /// Persistence store failure.
    #[error("store error: {0}")]
    Store(String),

    /// File system error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl CellError {
    /// Returns true for errors that only steer cycle control flow.
    #[must_use]
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::ResetDetected | Self::StepTimeout { .. })
    }
}

impl From<std::io::Error> for CellError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Convenience type alias for cell operations.
pub type CellResult<T> = Result<T, CellError>;
