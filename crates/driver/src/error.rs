//! Driver error types
//!
//! One enum per caller-facing surface: attach (controller), open (session
//! lookup), and I/O (read/write on an open session). `TransportError` is
//! what the transport collaborator reports and is carried verbatim inside
//! the other kinds.

use crate::endpoint::EndpointRole;
use crate::minor::Minor;
use thiserror::Error;

/// Errors reported by the transport collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transfer timed out")]
    Timeout,

    #[error("endpoint stalled")]
    Pipe,

    #[error("device disconnected")]
    NoDevice,

    #[error("entity not found")]
    NotFound,

    #[error("resource busy")]
    Busy,

    #[error("device sent more data than requested")]
    Overflow,

    #[error("input/output error")]
    Io,

    #[error("invalid parameter")]
    InvalidParam,

    #[error("access denied")]
    Access,

    #[error("transport error: {message}")]
    Other { message: String },
}

/// Failure to bind a newly enumerated device
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("endpoint {address:#04x} has no usable max packet size")]
    InvalidEndpoint { address: u8 },

    #[error("no free minor number")]
    NoMinorAvailable,

    #[error("device {0} is already bound")]
    AlreadyBound(String),

    #[error("could not arm interrupt poll: {0}")]
    InterruptPoll(#[source] TransportError),
}

/// Failure to open a session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpenError {
    #[error("no such device: minor {0}")]
    NoSuchDevice(Minor),
}

/// Failure of a read or write on an open session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoError {
    #[error("{0} endpoint unavailable")]
    EndpointUnavailable(EndpointRole),

    #[error("device has been removed")]
    DeviceGone,

    #[error("transfer timed out")]
    Timeout,

    #[error("transfer failed: {0}")]
    Transport(#[source] TransportError),
}

impl From<TransportError> for IoError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => IoError::Timeout,
            TransportError::NoDevice => IoError::DeviceGone,
            other => IoError::Transport(other),
        }
    }
}
