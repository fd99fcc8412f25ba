//! Test utilities
//!
//! [`MockTransport`] records every submission and keeps asynchronous
//! transfers pending until the test completes them, which lets tests pick
//! exactly when a "hardware" completion lands relative to detach and close.
//!
//! # Example
//!
//! ```
//! use driver::test_utils::MockTransport;
//! use driver::{Completion, Transport, TransferStatus};
//!
//! let transport = MockTransport::new();
//! transport
//!     .submit_bulk_async(0x06, vec![1, 2, 3], Box::new(|c: Completion| assert!(c.status.is_success())))
//!     .unwrap();
//! assert_eq!(transport.pending_writes(), 1);
//! assert!(transport.complete_next_write(TransferStatus::Completed));
//! ```

use crate::endpoint::EndpointDescriptor;
use crate::error::TransportError;
use crate::lock;
use crate::transport::{Completion, CompletionSink, TransferId, TransferStatus, Transport};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// FX2 endpoint layout: interrupt 0x81 (1 byte), bulk-out 0x06, bulk-in 0x88
pub fn fx2_endpoints() -> Vec<EndpointDescriptor> {
    vec![
        EndpointDescriptor::from_raw(0x81, 0x03, 1, 1),
        EndpointDescriptor::from_raw(0x06, 0x02, 512, 0),
        EndpointDescriptor::from_raw(0x88, 0x02, 512, 0),
    ]
}

/// FX2 layout without the switch endpoint
pub fn bulk_only_endpoints() -> Vec<EndpointDescriptor> {
    vec![
        EndpointDescriptor::from_raw(0x06, 0x02, 512, 0),
        EndpointDescriptor::from_raw(0x88, 0x02, 512, 0),
    ]
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

struct PendingTransfer {
    id: TransferId,
    endpoint: u8,
    buffer: Vec<u8>,
    sink: CompletionSink,
}

impl PendingTransfer {
    fn finish(self, status: TransferStatus, actual_length: usize) {
        (self.sink)(Completion {
            id: self.id,
            status,
            buffer: self.buffer,
            actual_length,
        });
    }
}

#[derive(Default)]
struct MockState {
    reads: VecDeque<Result<Vec<u8>, TransportError>>,
    read_requests: Vec<(u8, usize)>,
    writes: VecDeque<PendingTransfer>,
    written: Vec<(u8, Vec<u8>)>,
    interrupt: Option<PendingTransfer>,
    fail_writes: Option<TransportError>,
    fail_interrupt: Option<TransportError>,
    cancelled: Vec<TransferId>,
}

/// In-memory transport with manually completed asynchronous transfers
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    next_id: AtomicU64,
    calls: AtomicUsize,
    interrupt_submissions: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue data for the next bulk read
    pub fn push_read(&self, data: &[u8]) {
        lock(&self.state).reads.push_back(Ok(data.to_vec()));
    }

    /// Make the next bulk read fail
    pub fn push_read_error(&self, error: TransportError) {
        lock(&self.state).reads.push_back(Err(error));
    }

    /// `(endpoint, length)` of every bulk read requested so far
    pub fn read_requests(&self) -> Vec<(u8, usize)> {
        lock(&self.state).read_requests.clone()
    }

    /// Make every following bulk write submission fail
    pub fn fail_writes(&self, error: TransportError) {
        lock(&self.state).fail_writes = Some(error);
    }

    /// Make every following interrupt submission fail
    pub fn fail_interrupt_submissions(&self, error: TransportError) {
        lock(&self.state).fail_interrupt = Some(error);
    }

    /// Total number of calls into the transport
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of interrupt receives submitted so far
    pub fn interrupt_submissions(&self) -> usize {
        self.interrupt_submissions.load(Ordering::SeqCst)
    }

    /// Whether an interrupt receive is outstanding
    pub fn interrupt_pending(&self) -> bool {
        lock(&self.state).interrupt.is_some()
    }

    /// Number of bulk writes not yet completed
    pub fn pending_writes(&self) -> usize {
        lock(&self.state).writes.len()
    }

    /// `(endpoint, payload)` of every bulk write submitted so far
    pub fn written(&self) -> Vec<(u8, Vec<u8>)> {
        lock(&self.state).written.clone()
    }

    /// Ids passed to `cancel`
    pub fn cancelled(&self) -> Vec<TransferId> {
        lock(&self.state).cancelled.clone()
    }

    /// Complete the oldest pending write with `status`
    pub fn complete_next_write(&self, status: TransferStatus) -> bool {
        let Some(pending) = lock(&self.state).writes.pop_front() else {
            return false;
        };
        let actual = if status.is_success() {
            pending.buffer.len()
        } else {
            0
        };
        pending.finish(status, actual);
        true
    }

    /// Complete the outstanding interrupt receive with `data`
    pub fn complete_interrupt(&self, data: &[u8]) -> bool {
        let Some(mut pending) = lock(&self.state).interrupt.take() else {
            return false;
        };
        let len = data.len().min(pending.buffer.len());
        pending.buffer[..len].copy_from_slice(&data[..len]);
        pending.finish(TransferStatus::Completed, len);
        true
    }

    /// Fail the outstanding interrupt receive with `status`
    pub fn fail_interrupt(&self, status: TransferStatus) -> bool {
        let Some(pending) = lock(&self.state).interrupt.take() else {
            return false;
        };
        pending.finish(status, 0);
        true
    }

    /// Endpoint the outstanding interrupt receive was submitted on
    pub fn interrupt_endpoint(&self) -> Option<u8> {
        lock(&self.state).interrupt.as_ref().map(|p| p.endpoint)
    }

    fn next_id(&self) -> TransferId {
        TransferId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl Transport for MockTransport {
    fn submit_bulk(
        &self,
        endpoint: u8,
        buffer: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        state.read_requests.push((endpoint, buffer.len()));

        let data = state.reads.pop_front().unwrap_or(Err(TransportError::Timeout))?;
        let len = data.len().min(buffer.len());
        buffer[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    fn submit_bulk_async(
        &self,
        endpoint: u8,
        buffer: Vec<u8>,
        sink: CompletionSink,
    ) -> Result<TransferId, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        if let Some(error) = state.fail_writes.clone() {
            return Err(error);
        }

        let id = self.next_id();
        state.written.push((endpoint, buffer.clone()));
        state.writes.push_back(PendingTransfer {
            id,
            endpoint,
            buffer,
            sink,
        });
        Ok(id)
    }

    fn submit_interrupt_async(
        &self,
        endpoint: u8,
        buffer: Vec<u8>,
        sink: CompletionSink,
    ) -> Result<TransferId, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        if let Some(error) = state.fail_interrupt.clone() {
            return Err(error);
        }

        let id = self.next_id();
        state.interrupt = Some(PendingTransfer {
            id,
            endpoint,
            buffer,
            sink,
        });
        self.interrupt_submissions.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    fn cancel(&self, id: TransferId) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let cancelled = {
            let mut state = lock(&self.state);
            state.cancelled.push(id);

            if state.interrupt.as_ref().is_some_and(|p| p.id == id) {
                state.interrupt.take()
            } else if let Some(pos) = state.writes.iter().position(|p| p.id == id) {
                state.writes.remove(pos)
            } else {
                None
            }
        };

        // Outside the lock: the sink may call back into the transport.
        if let Some(pending) = cancelled {
            pending.finish(TransferStatus::Cancelled, 0);
        }
    }
}
