//! Error handling for the relay driver
//!
//! A single crate-wide error type covering input validation, transport
//! failures, protocol-level corruption, and the retry machinery. Transient
//! failures are retried internally by the controller; everything that is not
//! recovered locally surfaces as a typed error, never as a panic.

use thiserror::Error;

/// Relay driver error type
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    /// Locker id outside the addressable range (no bus traffic performed)
    #[error("Invalid locker id: {0}")]
    InvalidLockerId(u32),

    /// Transport unavailable or broken
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection state is not Connected; command refused without bus traffic
    #[error("Connection unavailable")]
    ConnectionUnavailable,

    /// No response within the configured timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Response frame failed CRC validation
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    CrcMismatch {
        /// CRC computed over the received frame body
        expected: u16,
        /// CRC carried in the received frame
        actual: u16,
    },

    /// Response frame too short or structurally invalid
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Modbus exception response from the relay board
    #[error("Modbus exception for function 0x{function:02X}: code 0x{code:02X} ({})", crate::modbus::exception_description(*.code))]
    Exception {
        /// Function code the exception responds to (error bit stripped)
        function: u8,
        /// Modbus exception code
        code: u8,
    },

    /// Write accepted but the read-back coil state disagrees
    #[error("Write verification failed: {0}")]
    VerificationFailed(String),

    /// All retry attempts exhausted; carries the final failure
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        /// Number of attempts performed
        attempts: u32,
        /// The error observed on the final attempt
        last: Box<RelayError>,
    },

    /// Configuration invalid or unreadable
    #[error("Configuration error: {0}")]
    Config(String),

    /// Command cancelled before it reached the bus
    #[error("Command cancelled")]
    Cancelled,

    /// Driver is shutting down; command refused
    #[error("Driver shut down")]
    Shutdown,
}

impl RelayError {
    /// Whether the controller should retry after this error.
    ///
    /// Bad input, cancellation, and state-gating errors fail immediately;
    /// everything transient (timeouts, corruption, transport drops) is
    /// worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Connection(_)
                | RelayError::Timeout(_)
                | RelayError::CrcMismatch { .. }
                | RelayError::MalformedFrame(_)
                | RelayError::Exception { .. }
                | RelayError::VerificationFailed(_)
        )
    }
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, RelayError>;
