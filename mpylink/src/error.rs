//! Error types for mpylink.

use crate::protocol::frame::{CommandCode, ResponseStatus};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for mpylink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mpylink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (transport or local file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Frame CRC did not match the payload.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// CRC carried by the frame.
        expected: u16,
        /// CRC computed over the received payload.
        actual: u16,
    },

    /// Malformed frame or response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The device answered with a non-zero status byte.
    #[error("Device reported {status}: {}", String::from_utf8_lossy(.data))]
    DeviceStatus {
        /// Status reported by the device.
        status: ResponseStatus,
        /// Remaining response bytes (usually a diagnostic message).
        data: Vec<u8>,
    },

    /// A frame payload does not fit the wire format.
    #[error("Frame payload too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Payload length that was requested.
        len: usize,
        /// Largest payload the codec accepts.
        max: usize,
    },

    /// Transport write/drain failure.
    #[error("Communication error: {0}")]
    Communication(String),

    /// The transport is not open.
    #[error("Transport is not open")]
    NotConnected,

    /// The device answered, but not with what the operation expects.
    #[error("Unexpected response to {operation}: {response:?}")]
    UnexpectedResponse {
        /// Operation that received the response.
        operation: &'static str,
        /// Response text as received.
        response: String,
    },

    /// No response within the command budget.
    #[error("Timeout: no response to {operation} after {after:?}")]
    Timeout {
        /// Operation that timed out.
        operation: &'static str,
        /// Budget that elapsed.
        after: Duration,
    },

    /// Another command is still in flight on this connection.
    #[error("Device busy: {pending} is still awaiting a response")]
    DeviceBusy {
        /// Command currently occupying the channel.
        pending: CommandCode,
    },

    /// The wait for a response was cancelled by the caller.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The requested file could not be read from the device.
    #[error("File not found: {path} ({reason})")]
    FileNotFound {
        /// Device-side path.
        path: String,
        /// Underlying failure.
        reason: String,
    },

    /// Invalid input rejected before anything was sent.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A chunk failed and the transfer was aborted.
    #[error("Transfer of {filename} failed at chunk {chunk_index}/{total_chunks}: {source}")]
    FileTransfer {
        /// Device-side file name.
        filename: String,
        /// Zero-based index of the failing chunk.
        chunk_index: usize,
        /// Number of chunks in the transfer.
        total_chunks: usize,
        /// Error that ended the chunk.
        #[source]
        source: Box<Error>,
    },

    /// Read-back after an upload differs from what was sent.
    #[error("Verification of {filename} failed: {detail}")]
    VerifyMismatch {
        /// Device-side file name.
        filename: String,
        /// Where the contents diverge.
        detail: String,
    },

    /// Every retry attempt failed.
    #[error("Failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        source: Box<Error>,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse error classes used to decide between retrying and aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// CRC mismatch, malformed frame or device-reported failure.
    Protocol,
    /// Transport-level failure.
    Communication,
    /// No response within budget.
    Timeout,
    /// Channel occupied.
    Busy,
    /// Missing device file.
    FileNotFound,
    /// Rejected input.
    Validation,
    /// Aborted or unverifiable file transfer.
    Transfer,
    /// Caller cancelled the wait.
    Cancelled,
    /// Bad configuration.
    Config,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CrcMismatch { .. }
            | Self::Protocol(_)
            | Self::DeviceStatus { .. }
            | Self::FrameTooLarge { .. } => ErrorKind::Protocol,
            #[cfg(feature = "native")]
            Self::Serial(_) => ErrorKind::Communication,
            Self::Io(_)
            | Self::Communication(_)
            | Self::NotConnected
            | Self::UnexpectedResponse { .. } => ErrorKind::Communication,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::DeviceBusy { .. } => ErrorKind::Busy,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::FileNotFound { .. } => ErrorKind::FileNotFound,
            Self::Validation(_) => ErrorKind::Validation,
            Self::FileTransfer { .. } | Self::VerifyMismatch { .. } => ErrorKind::Transfer,
            Self::RetriesExhausted { source, .. } => source.kind(),
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether another attempt could plausibly succeed.
    ///
    /// Only transport write/drain failures qualify. A closed port and a
    /// well-formed but unexpected answer are communication errors too, but
    /// sending again changes nothing.
    pub fn is_retryable(&self) -> bool {
        match self {
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            Self::Io(_) | Self::Communication(_) => true,
            _ => false,
        }
    }

    /// Whether this error, or the error it wraps, is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled(_) => true,
            Self::RetriesExhausted { source, .. } | Self::FileTransfer { source, .. } => {
                source.is_cancelled()
            },
            _ => false,
        }
    }

    /// The response status this error corresponds to, if any.
    pub fn response_status(&self) -> Option<ResponseStatus> {
        match self {
            Self::DeviceStatus { status, .. } => Some(*status),
            Self::Timeout { .. } => Some(ResponseStatus::Timeout),
            Self::DeviceBusy { .. } => Some(ResponseStatus::Busy),
            Self::FileNotFound { .. } => Some(ResponseStatus::NotFound),
            Self::RetriesExhausted { source, .. } | Self::FileTransfer { source, .. } => {
                source.response_status()
            },
            _ => None,
        }
    }
}
