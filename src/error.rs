//! # Plugwise Error Handling
//!
//! Error types shared by every layer of the protocol engine, from the serial
//! transport up to the polling controller.
//!
//! ## Error Categories
//!
//! ### Format errors
//! Malformed, truncated or checksum-mismatched frames. The transaction layer
//! swallows these and keeps reading; they never reach device code.
//!
//! ### Sequencing errors
//! A frame whose sequence counter does not match the outstanding request.
//! Most are reclassified (stale status, pong, advertisement) and dropped.
//!
//! ### Timeouts
//! No usable frame within the retry budget. Device code turns a timeout into
//! "device offline" and carries on with the next device.
//!
//! ### Value errors
//! A frame that decoded cleanly but carries a payload the caller cannot use.
//! The device stays online.
//!
//! ### Channel errors
//! The serial port itself failed. The transport closes the port and the
//! exchange in flight fails like a timeout. The next controller tick
//! reopens the port with backoff.
//!
//! ## Usage
//!
//! ```rust
//! use plugwise::{PlugwiseError, PlugwiseResult};
//!
//! fn report(result: PlugwiseResult<f64>) {
//!     match result {
//!         Ok(watts) => println!("{:.1} W", watts),
//!         Err(e) if e.marks_offline() => println!("device unavailable: {}", e),
//!         Err(e) => println!("operation failed: {}", e),
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for Plugwise operations
pub type PlugwiseResult<T> = Result<T, PlugwiseError>;

/// Errors raised by the Plugwise protocol engine
///
/// Every variant carries enough context to log a useful line without the
/// caller having to wrap it again.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlugwiseError {
    /// No valid frame arrived within the retry budget
    ///
    /// # Examples
    /// - Circle unplugged or out of radio range
    /// - Stick answered with the `00E1` "unreachable" status
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Frame format violation
    ///
    /// Header, footer, length, hex digits or checksum did not validate.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Checksum mismatch on a received frame
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Response sequence counter did not match the outstanding request
    #[error("Out of sequence: expected={expected:04X}, received={received:04X}")]
    Sequence { expected: u16, received: u16 },

    /// Function code not known to this implementation
    #[error("Unknown function code: {code:04X}")]
    UnknownFunction { code: u16 },

    /// Acknowledgement carrying a status the operation cannot accept
    #[error("Unexpected status {status:04X}: {context}")]
    UnexpectedStatus { status: u16, context: String },

    /// Semantically invalid value in an otherwise valid exchange
    ///
    /// # Examples
    /// - Log buffer slot with no timestamps where one is required
    /// - Watt value outside the range the calibration can express
    #[error("Invalid value: {message}")]
    Value { message: String },

    /// Serial channel failure
    #[error("Channel error: {message}")]
    Channel { message: String },

    /// Configuration problem
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PlugwiseError {
    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol (frame format) error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a sequence mismatch error
    pub fn sequence(expected: u16, received: u16) -> Self {
        Self::Sequence { expected, received }
    }

    /// Create an unknown function code error
    pub fn unknown_function(code: u16) -> Self {
        Self::UnknownFunction { code }
    }

    /// Create an unexpected acknowledgement status error
    pub fn unexpected_status<S: Into<String>>(status: u16, context: S) -> Self {
        Self::UnexpectedStatus {
            status,
            context: context.into(),
        }
    }

    /// Create a value error
    pub fn value<S: Into<String>>(message: S) -> Self {
        Self::Value { message: message.into() }
    }

    /// Create a channel error
    pub fn channel<S: Into<String>>(message: S) -> Self {
        Self::Channel { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if retrying the same exchange later might succeed
    ///
    /// ```rust
    /// use plugwise::PlugwiseError;
    ///
    /// assert!(PlugwiseError::timeout("get_info", 6000).is_recoverable());
    /// assert!(!PlugwiseError::configuration("bad mac").is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Channel { .. }
                | Self::Protocol { .. }
                | Self::CrcMismatch { .. }
                | Self::Sequence { .. }
        )
    }

    /// Check if the error comes from the serial channel rather than the frames on it
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Channel { .. })
    }

    /// Check if the error is a frame level protocol problem
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::CrcMismatch { .. }
                | Self::Sequence { .. }
                | Self::UnknownFunction { .. }
        )
    }

    /// Check if the error means the device should be treated as offline
    ///
    /// Channel failures surface with timeout semantics to device code.
    pub fn marks_offline(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Channel { .. })
    }
}

impl From<std::io::Error> for PlugwiseError {
    fn from(err: std::io::Error) -> Self {
        Self::channel(err.to_string())
    }
}

impl From<tokio_serial::Error> for PlugwiseError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::channel(format!("serial port: {}", err))
    }
}

/// Converts Tokio's timeout errors to `PlugwiseError::Timeout`; callers that
/// know the budget should build the error themselves.
impl From<tokio::time::error::Elapsed> for PlugwiseError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<serde_json::Error> for PlugwiseError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<std::num::ParseIntError> for PlugwiseError {
    fn from(err: std::num::ParseIntError) -> Self {
        Self::protocol(format!("invalid hex field: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = PlugwiseError::timeout("get_power_usage", 6000);
        assert!(err.is_recoverable());
        assert!(err.is_transport_error());
        assert!(err.marks_offline());

        let err = PlugwiseError::value("empty log slot");
        assert!(!err.is_recoverable());
        assert!(!err.marks_offline());

        let err = PlugwiseError::crc_mismatch(0x1234, 0x5678);
        assert!(err.is_protocol_error());
        assert!(!err.marks_offline());
    }

    #[test]
    fn test_error_display() {
        let err = PlugwiseError::crc_mismatch(0x1234, 0x5678);
        let msg = format!("{}", err);
        assert!(msg.contains("CRC validation failed"));
        assert!(msg.contains("1234"));
        assert!(msg.contains("5678"));

        let err = PlugwiseError::unexpected_status(0x00E1, "switch");
        assert_eq!(format!("{}", err), "Unexpected status 00E1: switch");
    }

    #[test]
    fn test_io_error_becomes_channel_error() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: PlugwiseError = io.into();
        assert!(matches!(err, PlugwiseError::Channel { .. }));
        assert!(err.marks_offline());
    }
}
