//! Error types for bus, module and profile operations.
//!
//! `CtlabError` is the single error type returned by every public operation in
//! the crate. It is built with `thiserror` so that lower level failures (mostly
//! `std::io::Error` from the transport) convert with `?`.
//!
//! ## Error Categories
//!
//! 1. **Connection state** - `NoConnection`, `NotConnected`, `ModeMismatch`
//!    - Raised synchronously, before any byte is written.
//!    - Recovery: connect (or pick the right dispatch mode) and call again.
//!
//! 2. **Caller mistakes** - `InvalidParameter`, `NoValue`, `DuplicateModule`, `RequestPending`
//!    - Checked before any I/O, so malformed traffic never reaches the bus.
//!
//! 3. **Device faults** - `Communication`, `CalibrationWrite`, `WriteEnable`
//!    - Attributed to the peer module. Never retried locally.
//!
//! 4. **Transport** - `Io`, `Timeout`
//!
//! Callers driving energized hardware are expected to catch broadly and put
//! their outputs into a safe state before propagating the error.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type CtlabResult<T> = std::result::Result<T, CtlabError>;

/// Primary error type for the crate.
#[derive(Error, Debug)]
pub enum CtlabError {
    /// The module or connection has no live transport to write to.
    #[error("No connection associated with this module")]
    NoConnection,

    /// The connection exists but `connect()` has not succeeded yet.
    #[error("The connection is not connected")]
    NotConnected,

    /// A cached value was read before any response populated it.
    #[error("Value for module {module} channel {channel} is not available (yet)")]
    NoValue {
        /// Module id
        module: u8,
        /// Channel id
        channel: u8,
    },

    /// A caller supplied value lies outside the profile's domain.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A received value violates an enumeration or consistency rule.
    #[error("Communication error: {0}")]
    Communication(String),

    /// The status word returned after a calibration assignment flags an error.
    #[error("Failed to set calibration channel {channel} on module {module}: status {status:#x}")]
    CalibrationWrite {
        /// Module id
        module: u8,
        /// Calibration channel that was written
        channel: u8,
        /// Status word returned by the module
        status: i64,
    },

    /// The module did not confirm the EEPROM write-enable handshake.
    #[error("Failed to enable EEPROM write on module {module}: status {status:#x}")]
    WriteEnable {
        /// Module id
        module: u8,
        /// Status word returned by the module
        status: i64,
    },

    /// An event-driven query was not answered in time.
    #[error("Timed out after {timeout_ms} ms waiting for module {module} channel {channel}")]
    Timeout {
        /// Module id
        module: u8,
        /// Channel id
        channel: u8,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// A second request was issued for a channel that still has one outstanding.
    #[error("A request for module {module} channel {channel} is already pending")]
    RequestPending {
        /// Module id
        module: u8,
        /// Channel id
        channel: u8,
    },

    /// Module ids must be unique per connection.
    #[error("Module id {0} is already registered on this connection")]
    DuplicateModule(u8),

    /// The operation is not available in the connection's current dispatch mode.
    #[error("Operation requires {required} dispatch mode, connection is in {actual} mode")]
    ModeMismatch {
        /// Mode the operation needs
        required: &'static str,
        /// Mode the connection is in
        actual: &'static str,
    },

    /// Transport level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A received line that the addressed module could not accept.
///
/// Profile decoders return this; it is cheap to clone so the same fault can be
/// delivered both to a pending waiter and to the caller of `receive()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct DecodeError(pub String);

impl DecodeError {
    /// Build a decode error from anything printable.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<DecodeError> for CtlabError {
    fn from(value: DecodeError) -> Self {
        CtlabError::Communication(value.0)
    }
}

impl CtlabError {
    /// Whether the fault is attributed to the peer device rather than the caller.
    pub fn is_device_fault(&self) -> bool {
        matches!(
            self,
            CtlabError::Communication(_)
                | CtlabError::CalibrationWrite { .. }
                | CtlabError::WriteEnable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_becomes_communication_error() {
        let err: CtlabError = DecodeError::new("rng = 9").into();
        match &err {
            CtlabError::Communication(msg) => assert_eq!(msg, "rng = 9"),
            other => panic!("unexpected variant: {:?}", other),
        }
        assert_eq!(err.to_string(), "Communication error: rng = 9");
        assert!(err.is_device_fault());
    }

    #[test]
    fn caller_errors_are_not_device_faults() {
        assert!(!CtlabError::InvalidParameter("channel 8".into()).is_device_fault());
        assert!(!CtlabError::NoConnection.is_device_fault());
    }

    #[test]
    fn calibration_status_is_rendered_in_hex() {
        let err = CtlabError::CalibrationWrite {
            module: 2,
            channel: 103,
            status: 0x41,
        };
        assert!(err.to_string().contains("0x41"));
    }
}
