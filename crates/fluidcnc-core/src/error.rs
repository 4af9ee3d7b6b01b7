//! Error handling for FluidCNC
//!
//! Provides error types for every layer of the machine link:
//! - Connection errors (transport open/write/loss)
//! - Command errors (correlated `ok`/`error:N` failures, timeouts, alarms)
//! - Validation errors (commands refused before transmission)
//! - Stream and lockout errors (streaming engine and emergency-stop lockout)
//! - Protocol errors (unparseable lines, logged and dropped)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Connection error type
///
/// Represents failures of the transport itself. These feed the reconnect
/// policy and are never raised into the middle of a command.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Failed to open the transport
    #[error("Failed to open {endpoint}: {reason}")]
    FailedToOpen {
        /// The endpoint (URL or port) that failed to open.
        endpoint: String,
        /// The reason the endpoint failed to open.
        reason: String,
    },

    /// Connection lost
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// No live transport
    #[error("Not connected")]
    NotConnected,

    /// A write to the transport failed
    #[error("Write to {endpoint} failed: {reason}")]
    WriteFailed {
        /// The endpoint the write was addressed to.
        endpoint: String,
        /// The reason the write failed.
        reason: String,
    },

    /// Invalid connection parameters
    #[error("Invalid connection parameters: {reason}")]
    InvalidParameters {
        /// The reason the parameters are invalid.
        reason: String,
    },

    /// Automatic reconnection gave up
    #[error("Reconnect gave up after {attempts} attempts; reconnect manually")]
    ReconnectExhausted {
        /// Number of attempts that were made.
        attempts: u32,
    },
}

/// Command error type
///
/// Represents the failure of exactly one correlated command.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// Firmware answered `error:N`
    #[error("error:{code} ({message}) for '{command}'")]
    Rejected {
        /// The numeric error code.
        code: u32,
        /// Decoded error text.
        message: String,
        /// The command that was rejected.
        command: String,
    },

    /// No response arrived in time
    #[error("'{command}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The command that timed out.
        command: String,
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// The transport went away while the command was outstanding
    #[error("Connection lost while waiting for '{command}'")]
    ConnectionLost {
        /// The command that was outstanding.
        command: String,
    },

    /// An alarm was raised while the command was outstanding
    #[error("ALARM:{code} - {message}")]
    Alarm {
        /// The alarm code.
        code: u32,
        /// Decoded alarm text.
        message: String,
    },

    /// The firmware buffers were flushed (soft reset, stop or e-stop)
    #[error("'{command}' was flushed before it was acknowledged")]
    Flushed {
        /// The command that was dropped.
        command: String,
    },
}

/// Validation error type
///
/// Raised by the safety gate; the command is never transmitted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Structurally invalid command
    #[error("Malformed command '{command}': {reason}")]
    Malformed {
        /// The offending command.
        command: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Blocked by a semantic check or by the external fixer
    #[error("Command '{command}' blocked: {reason}")]
    Blocked {
        /// The offending command.
        command: String,
        /// Why it was blocked.
        reason: String,
    },

    /// Motion lockout is engaged after an emergency stop
    #[error("Motion locked out after emergency stop: '{command}' refused")]
    MotionLocked {
        /// The refused command.
        command: String,
    },

    /// Target position falls outside the soft limits
    #[error("Soft limit on {axis}: target {target:.3} outside [{min:.3}, {max:.3}]")]
    SoftLimit {
        /// Axis letter.
        axis: char,
        /// Requested machine-coordinate target.
        target: f64,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },

    /// Invalid argument to a command helper
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What is wrong with the argument.
        reason: String,
    },
}

/// Streaming engine error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    /// A stream session is already running
    #[error("A stream is already active")]
    AlreadyActive,

    /// No stream session is running
    #[error("No stream is active")]
    NotActive,

    /// The program contained no commands after normalisation
    #[error("Program contains no commands")]
    Empty,

    /// A program line can never be sent
    #[error("Line {index} cannot be streamed: {reason}")]
    InvalidLine {
        /// Zero-based index of the normalised line.
        index: usize,
        /// Why the line was refused.
        reason: String,
    },
}

/// Motion lockout error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LockoutError {
    /// The minimum hold time has not elapsed yet
    #[error("Lockout cannot be cleared for another {remaining_ms}ms")]
    TooSoon {
        /// Remaining hold time in milliseconds.
        remaining_ms: u64,
    },

    /// The machine is not in a recognised safe state
    #[error("Lockout cannot be cleared while the machine is {status}")]
    UnsafeState {
        /// The current machine status.
        status: String,
    },

    /// No lockout is engaged
    #[error("Motion lockout is not engaged")]
    NotEngaged,
}

/// Protocol error type
///
/// Only ever logged; a bad line never halts processing of the next one.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// A line could not be interpreted
    #[error("Unparseable line '{line}': {reason}")]
    Unparseable {
        /// The raw line.
        line: String,
        /// Why parsing failed.
        reason: String,
    },
}

/// Main error type for FluidCNC
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Command error
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Validation error
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Stream error
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Lockout error
    #[error(transparent)]
    Lockout(#[from] LockoutError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Command(CommandError::Timeout { .. }))
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Command(CommandError::ConnectionLost { .. })
        )
    }

    /// Check if the safety gate refused the command
    pub fn is_validation_error(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_message_carries_code_and_command() {
        let err = CommandError::Rejected {
            code: 9,
            message: "G-code locked out during alarm or jog state".to_string(),
            command: "G0 X10".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("error:9"));
        assert!(text.contains("G0 X10"));
    }

    #[test]
    fn test_error_classification() {
        let err: Error = CommandError::Timeout {
            command: "$H".to_string(),
            timeout_ms: 100,
        }
        .into();
        assert!(err.is_timeout());
        assert!(!err.is_connection_error());

        let err: Error = ConnectionError::NotConnected.into();
        assert!(err.is_connection_error());

        let err: Error = ValidationError::MotionLocked {
            command: "$J=G91 X1 F100".to_string(),
        }
        .into();
        assert!(err.is_validation_error());
    }
}
