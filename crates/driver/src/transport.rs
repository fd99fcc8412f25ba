//! Transport collaborator contract
//!
//! The driver core never talks to a host controller directly. Everything
//! that moves bytes goes through [`Transport`], which the host runtime
//! implements (`usb::RusbTransport` for real hardware, `test_utils::MockTransport`
//! in tests).
//!
//! Asynchronous submissions hand the buffer over by value and get it back in
//! the [`Completion`], so a completion can never write into memory the
//! submitter has already dropped.

use crate::error::TransportError;
use std::fmt;
use std::time::Duration;

/// Identifier of an asynchronous transfer, unique per transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Final status of an asynchronous transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Cancelled,
    TimedOut,
    Stall,
    NoDevice,
    Overflow,
    Error,
}

impl TransferStatus {
    pub fn is_success(self) -> bool {
        self == TransferStatus::Completed
    }
}

/// Result of an asynchronous transfer, delivered to its sink exactly once
#[derive(Debug)]
pub struct Completion {
    pub id: TransferId,
    pub status: TransferStatus,
    /// The buffer that was submitted, returned to the owner
    pub buffer: Vec<u8>,
    /// Bytes actually moved; for IN transfers the valid prefix of `buffer`
    pub actual_length: usize,
}

/// Callback receiving a completion, run on a context the submitter does not control
pub type CompletionSink = Box<dyn FnOnce(Completion) + Send + 'static>;

/// Operations the driver consumes from the host runtime
pub trait Transport: Send + Sync + 'static {
    /// Blocking bulk IN transfer into `buffer`, returning the byte count
    fn submit_bulk(
        &self,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Queue a bulk OUT transfer of the whole `buffer`
    ///
    /// On `Ok` the sink is called exactly once. On `Err` the sink is dropped
    /// without being called.
    fn submit_bulk_async(
        &self,
        endpoint: u8,
        buffer: Vec<u8>,
        sink: CompletionSink,
    ) -> Result<TransferId, TransportError>;

    /// Queue an interrupt IN transfer filling `buffer`
    ///
    /// Same sink contract as [`Transport::submit_bulk_async`].
    fn submit_interrupt_async(
        &self,
        endpoint: u8,
        buffer: Vec<u8>,
        sink: CompletionSink,
    ) -> Result<TransferId, TransportError>;

    /// Request cancellation of a queued transfer
    ///
    /// The transfer's sink later sees `TransferStatus::Cancelled` unless it
    /// already completed. Unknown or finished ids are ignored.
    fn cancel(&self, id: TransferId);
}
