//! Our error types for UPS link communications and local validation.

use thiserror::Error;

pub type Result<T, I> = core::result::Result<T, Error<I>>;

/// Custom error type for UPS driver communications.
///
/// Generic over the link's own error type, so the same taxonomy works for a
/// real serial port and for the mock link used in tests.
#[derive(Error, Debug)]
pub enum Error<I: embedded_io::Error> {
    /// Nothing arrived before the deadline. Retried a bounded number of times.
    #[error("communication timeout")]
    Timeout,
    /// Fewer bytes than the minimum expected arrived before the deadline.
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
    /// The reply did not match the expected envelope. Never retried.
    #[error("malformed reply: {0}")]
    Malformed(&'static str),
    /// The device explicitly signalled "command not understood".
    #[error("command rejected by device")]
    Rejected,
    /// I/O error on the link. The transport must be closed and reopened.
    #[error("device gone")]
    DeviceGone(I),
    /// Session-protocol login handshake was not accepted.
    #[error("session login rejected by device")]
    LoginFailed,
    /// A write value fell outside the currently published range.
    #[error("value {value} outside allowed range {min}..={max}")]
    OutOfRange { value: f64, min: f64, max: f64 },
    /// A write value did not match any of the currently published enum values.
    #[error("value {0:?} is not an allowed enum value")]
    NotEnum(String),
    /// A string write value exceeded the published maximum width.
    #[error("value longer than the allowed {max} characters")]
    TooLong { max: usize },
    /// No item with this name, or the item does not support the operation.
    #[error("no such variable or command: {0}")]
    Unknown(String),
    /// The named variable exists but is not settable.
    #[error("variable {0} is read-only")]
    ReadOnly(String),
    /// No subdriver recognized the connected device.
    #[error("no subdriver claimed the device")]
    NotClaimed,
    /// The transport has been dropped after a DeviceGone and not re-attached.
    #[error("no transport attached")]
    NoTransport,
}

impl<I: embedded_io::Error> Error<I> {
    /// Rejected and Malformed share one policy: mark `skip` during Init,
    /// otherwise miss just this tick.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::Rejected | Error::Malformed(_))
    }
}
