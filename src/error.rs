//! Error types for the Legacy DFU session engine.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Classification of a transport failure.
///
/// Only `Disconnected` counts as the expected side effect of a peripheral
/// reboot; everything else is a genuine failure.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransportErrorKind {
    /// The link dropped, or the operation ran against a link that is down.
    Disconnected,
    /// The transport gave up waiting on the peer.
    Timeout,
    /// The adapter, peripheral or characteristic does not exist.
    NotFound,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportErrorKind::Disconnected => "disconnected",
            TransportErrorKind::Timeout => "timed out",
            TransportErrorKind::NotFound => "not found",
            TransportErrorKind::Other => "transport failure",
        };
        f.write_str(s)
    }
}

/// Error raised by a BLE transport implementation.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        TransportError {
            kind,
            message: message.into(),
        }
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Disconnected, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::NotFound, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Other, message)
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// True when the failure means the link went away.
    pub fn is_disconnect(&self) -> bool {
        self.kind == TransportErrorKind::Disconnected
    }
}

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        let kind = match &err {
            btleplug::Error::NotConnected => TransportErrorKind::Disconnected,
            btleplug::Error::TimedOut(_) => TransportErrorKind::Timeout,
            btleplug::Error::DeviceNotFound | btleplug::Error::NoSuchCharacteristic => {
                TransportErrorKind::NotFound
            }
            _ => TransportErrorKind::Other,
        };
        TransportError::new(kind, err.to_string())
    }
}

/// Errors that terminate a DFU session.
#[derive(Debug, Error)]
pub enum DfuError {
    /// The firmware archive is unusable.
    #[error("Malformed firmware package: {0}")]
    MalformedPackage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to connect after {attempts} attempts: {reason}")]
    ConnectionFailed { attempts: usize, reason: String },

    #[error("Timeout waiting for DFU response after {0:?}")]
    ResponseTimeout(Duration),

    #[error("Start DFU failed, response: {response:02X?}")]
    StartRejected { response: Vec<u8> },

    #[error("Init packet rejected, response: {response:02X?}")]
    InitRejected { response: Vec<u8> },

    #[error("Firmware upload rejected, response: {response:02X?}")]
    TransferRejected { response: Vec<u8> },

    /// The peripheral reported status 0x06 after the image transfer. Usually a
    /// flow control problem on the central side; a lower PRN value helps.
    #[error("Firmware upload failed: status 0x06 (operation failed), try a lower PRN value")]
    TransferOperationFailed,

    #[error("Firmware validation failed, response: {response:02X?}")]
    ValidationFailed { response: Vec<u8> },

    #[error("Legacy DFU service not found on device")]
    ServiceNotFound,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// An engine operation was invoked outside its place in the command sequence.
    #[error("{operation} cannot run in phase {phase}")]
    OutOfSequence {
        operation: &'static str,
        phase: String,
    },

    #[error("Operation cancelled by user")]
    Cancelled,
}

impl DfuError {
    /// Connectivity-class failures are worth retrying; protocol rejections are not.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            DfuError::DeviceNotFound(_) | DfuError::ConnectionFailed { .. } | DfuError::Transport(_)
        )
    }

    /// True when the underlying cause is the link going away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, DfuError::Transport(e) if e.is_disconnect())
    }
}
