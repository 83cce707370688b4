//! Error types and handling for rs2-bridge
//!
//! Every bridge surfaces at most one terminal error to its consumer. The
//! variants below follow the taxonomy the bridges care about: outside
//! cancellation, disposal, faults raised by producers or combiners, and
//! protocol misuse by the caller.

use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// External cancellation was requested
    #[error("Operation cancelled")]
    Cancelled,
    /// The consumer disposed the bridge while producers were still active
    #[error("Bridge disposed")]
    Disposed,
    /// A producer or combining function failed
    #[error("Producer fault: {0}")]
    Fault(String),
    /// A call was made outside the permitted sequence (double pull,
    /// emit after completion, completing a handle twice, ...)
    #[error("Protocol misuse: {0}")]
    Misuse(&'static str),
    /// A pooled completion handle was used after being returned
    #[error("Stale completion handle")]
    StaleHandle,
    /// Custom error with message
    #[error("Bridge error: {0}")]
    Custom(String),
}

impl BridgeError {
    /// Build a fault from anything displayable.
    pub fn fault(msg: impl std::fmt::Display) -> Self {
        BridgeError::Fault(msg.to_string())
    }

    /// True for errors that represent a request to stop rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BridgeError::Cancelled | BridgeError::Disposed)
    }

    /// True for programming errors (misuse, stale handles).
    pub fn is_misuse(&self) -> bool {
        matches!(self, BridgeError::Misuse(_) | BridgeError::StaleHandle)
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Fault(err.to_string())
    }
}

impl From<tokio::task::JoinError> for BridgeError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            BridgeError::Cancelled
        } else {
            BridgeError::Fault(format!("worker panicked: {}", err))
        }
    }
}

/// Result type for rs2-bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
