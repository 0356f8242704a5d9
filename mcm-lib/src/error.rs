use crate::session::Mode;
use std::array::TryFromSliceError;
use thiserror::Error;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, McmError>;

/// Failures reported by a [`UsbTransport`](crate::transport::UsbTransport) implementation
/// that are not expressed as a transfer status.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    #[error("Interface {0} is already claimed")]
    AlreadyClaimed(u8),

    #[error("Transport is not open")]
    NotOpen,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Transfer cancelled")]
    Cancelled,
}

/// The primary error type for the `mcm-lib` library.
#[derive(Error, Debug)]
pub enum McmError {
    #[error("No MCM device selected")]
    NoDeviceSelected,

    #[error("Endpoint detection failed: {0}")]
    EndpointDetectionFailed(String),

    #[error("Device indicated an error occurred (endpoint stalled)")]
    DeviceSignalledError,

    #[error("Device returned more data than expected")]
    UnexpectedDataVolume,

    #[error("Not all data could be sent: wrote {written} of {expected} bytes")]
    IncompleteWrite { written: usize, expected: usize },

    #[error("Transfer gave unexpected status: {0}")]
    UnexpectedTransferStatus(String),

    #[error("A bulk receiver is already running")]
    ReceiverAlreadyRunning,

    #[error("Timed out waiting for a response from the device")]
    ResponseTimeout,

    #[error("CRC mismatch: frame carries 0x{received:04X}, computed 0x{computed:04X}")]
    CorruptChecksum { received: u16, computed: u16 },

    #[error("Unexpected command: got 0x{got:04X}, want 0x{want:04X}")]
    UnexpectedCommand { got: u16, want: u16 },

    #[error("Device reported error 0x{code:02X} for command 0x{command:04X}: {message}")]
    DeviceReportedError { command: u16, code: u8, message: String },

    #[error("Device reported failure: {0}")]
    DeviceReportedFailure(String),

    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),

    #[error("Frame payload of {len} bytes does not fit the length field")]
    FrameTooLarge { len: usize },

    #[error("Operation requires mode {expected}, device is in mode {actual}")]
    ModeMismatch { expected: Mode, actual: Mode },

    #[error("Bulk IN stream is owned by the background receiver")]
    BulkStreamBusy,

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<TryFromSliceError> for McmError {
    fn from(_: TryFromSliceError) -> Self {
        McmError::InvalidResponse("Failed to convert slice to array".to_string())
    }
}

impl From<serde_json::Error> for McmError {
    fn from(err: serde_json::Error) -> Self {
        McmError::InvalidSchedule(err.to_string())
    }
}

impl McmError {
    /// True when the failure means the device is gone and the session must be reconnected.
    pub fn is_device_lost(&self) -> bool {
        matches!(
            self,
            McmError::NoDeviceSelected | McmError::Transport(TransportError::Disconnected)
        )
    }
}
