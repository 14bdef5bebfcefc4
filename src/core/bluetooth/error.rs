//! Error types for the Bluetooth layer

use thiserror::Error;

/// Errors reported by a BLE transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Bluetooth adapter not available")]
    AdapterNotAvailable,

    #[error("Device not found: {address}")]
    DeviceNotFound { address: String },

    #[error("GATT operation failed: {0}")]
    Gatt(String),

    #[error("Platform error: {0}")]
    Platform(String),
}

impl From<bluest::Error> for TransportError {
    fn from(err: bluest::Error) -> Self {
        TransportError::Platform(err.to_string())
    }
}

/// The operation's generation was invalidated before it completed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Operation cancelled")]
pub struct Cancelled;

/// What a guarded transport call can propagate. Timeouts are not errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<Cancelled> for OperationError {
    fn from(_: Cancelled) -> Self {
        OperationError::Cancelled
    }
}
