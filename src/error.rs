//! Error types for the daq-stream crate.

use std::error::Error as StdError;
use std::fmt;

// =============================================================================
// Streaming Error
// =============================================================================

/// Streaming-session error type.
///
/// This error type covers the whole session lifecycle: device configuration,
/// buffer allocation, per-transfer failures and analysis-side failures. The
/// distinguished "stream completed" driver status is *not* an error and never
/// appears here (see [`crate::device::TransferOutcome`]).
#[derive(Debug)]
pub enum Error {
    /// The device driver returned a negative status code.
    ///
    /// The message is the driver's rendering of the code via
    /// `DeviceFacade::error_string`.
    Device { code: i32, message: String },

    /// The driver did not complete a transfer within the configured timeout.
    TransferTimeout,

    /// The device FIFO overran during a transfer (data was lost).
    FifoOverrun,

    /// Invalid configuration or API misuse.
    InvalidConfig(String),

    /// An analysis task could not allocate its result sink.
    SinkAllocation(String),

    /// An analysis worker panicked.
    WorkerPanic,

    /// I/O error while persisting results.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Device { code, message } => {
                write!(f, "device error {}: {}", code, message)
            }
            Error::TransferTimeout => write!(f, "stream transfer timeout"),
            Error::FifoOverrun => write!(f, "fifo overrun: transfer data lost"),
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Error::SinkAllocation(msg) => {
                write!(f, "failed to allocate analysis result sink: {}", msg)
            }
            Error::WorkerPanic => write!(f, "analysis worker panicked"),
            Error::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl Error {
    /// Create a device error from a raw status code and its rendered message.
    pub fn device(code: i32, message: impl Into<String>) -> Self {
        Error::Device {
            code,
            message: message.into(),
        }
    }

    /// Create an invalid config error with a message.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }

    /// Create a sink allocation error with a message.
    pub fn sink_allocation(msg: impl Into<String>) -> Self {
        Error::SinkAllocation(msg.into())
    }

    /// Returns true if this is a device status error.
    pub fn is_device(&self) -> bool {
        matches!(self, Error::Device { .. })
    }

    /// Returns true if this is a transfer timeout.
    pub fn is_transfer_timeout(&self) -> bool {
        matches!(self, Error::TransferTimeout)
    }

    /// Returns true if this is a FIFO overrun.
    pub fn is_fifo_overrun(&self) -> bool {
        matches!(self, Error::FifoOverrun)
    }

    /// Returns true if this is a sink allocation failure.
    pub fn is_sink_allocation(&self) -> bool {
        matches!(self, Error::SinkAllocation(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

/// Result type for streaming operations.
pub type Result<T> = std::result::Result<T, Error>;
