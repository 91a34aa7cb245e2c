//! Error types for the BLE session core.

use crate::domain::models::{CharacteristicKey, OperationKind};
use thiserror::Error;

/// Caller-visible failure of a session request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    /// Adapter is off or absent. Not retried; the caller must re-enable it.
    #[error("bluetooth radio is unavailable")]
    RadioUnavailable,

    /// The transport refused the request at submission time.
    #[error("transport rejected the request: {0}")]
    TransportRejected(String),

    /// The link dropped while the request was queued or in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// Service discovery failed; the connection has been torn down.
    #[error("service discovery failed: {0}")]
    DiscoveryFailed(String),

    /// The connection is not ready for GATT operations.
    #[error("connection is not ready")]
    NotReady,

    #[error("{target} does not support {required}")]
    UnsupportedCapability {
        target: CharacteristicKey,
        required: OperationKind,
    },

    #[error("timed out waiting for the transport")]
    Timeout,

    #[error("device {0} has not been discovered")]
    DeviceNotFound(String),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(CharacteristicKey),

    /// The transport completed the operation with a non-success GATT status.
    #[error("GATT operation failed with status {status}")]
    Gatt { status: i32 },

    #[error("invalid characteristic address: {0}")]
    InvalidAddress(String),

    /// The session actor is gone.
    #[error("session closed")]
    SessionClosed,
}

/// Submission-time refusal reported by a transport adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("radio unavailable")]
    RadioUnavailable,
    #[error("{0}")]
    Rejected(String),
}

impl TransportError {
    /// Map a refused connect or GATT submission onto the session taxonomy.
    pub fn into_rejection(self) -> BleError {
        BleError::TransportRejected(self.to_string())
    }
}

pub type Result<T, E = BleError> = std::result::Result<T, E>;
