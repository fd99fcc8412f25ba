//! Transport over a claimed rusb device handle
//!
//! libusb's synchronous API is used throughout. Asynchronous submissions
//! are queued to one worker thread per direction:
//! - `osrfx2-bulk-out` runs queued bulk writes in order,
//! - `osrfx2-intr-in` waits on the interrupt endpoint in short slices so a
//!   cancel is noticed between them.
//!
//! A write that has already reached libusb runs to completion or timeout;
//! cancel only affects writes still in the queue.

use crate::config::UsbSettings;
use crate::error::TransportError;
use crate::lock;
use crate::transport::{Completion, CompletionSink, TransferId, TransferStatus, Transport};
use async_channel::{Receiver, Sender, unbounded};
use rusb::{Context, DeviceHandle};
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Map a rusb error to the driver's transport error
pub fn map_rusb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::Pipe => TransportError::Pipe,
        rusb::Error::NoDevice => TransportError::NoDevice,
        rusb::Error::NotFound => TransportError::NotFound,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::Overflow => TransportError::Overflow,
        rusb::Error::Io => TransportError::Io,
        rusb::Error::InvalidParam => TransportError::InvalidParam,
        rusb::Error::Access => TransportError::Access,
        _ => TransportError::Other {
            message: err.to_string(),
        },
    }
}

/// Completion status for a transfer that failed with `err`
fn status_of(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::Timeout => TransferStatus::TimedOut,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::NoDevice => TransferStatus::NoDevice,
        rusb::Error::Overflow => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

struct Job {
    id: TransferId,
    endpoint: u8,
    buffer: Vec<u8>,
    sink: CompletionSink,
}

impl Job {
    fn finish(self, status: TransferStatus, actual_length: usize) {
        (self.sink)(Completion {
            id: self.id,
            status,
            buffer: self.buffer,
            actual_length,
        });
    }
}

/// State shared with the worker threads
struct Shared {
    handle: DeviceHandle<Context>,
    interface: u8,
    cancelled: Mutex<HashSet<TransferId>>,
    closed: AtomicBool,
    label: String,
}

impl Shared {
    fn take_cancelled(&self, id: TransferId) -> bool {
        self.closed.load(Ordering::Acquire) || lock(&self.cancelled).remove(&id)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        match self.handle.release_interface(self.interface) {
            Ok(()) => debug!("{}: released interface {}", self.label, self.interface),
            // Already gone when the device was unplugged
            Err(rusb::Error::NoDevice) => {}
            Err(e) => warn!(
                "{}: failed to release interface {}: {}",
                self.label, self.interface, e
            ),
        }
    }
}

/// [`Transport`] for one claimed FX2 interface
pub struct RusbTransport {
    shared: Arc<Shared>,
    bulk_out: Sender<Job>,
    interrupt_in: Sender<Job>,
    next_id: AtomicU64,
}

impl RusbTransport {
    /// Take ownership of `handle`, whose `interface` is already claimed
    pub fn new(
        handle: DeviceHandle<Context>,
        interface: u8,
        settings: &UsbSettings,
        label: &str,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            handle,
            interface,
            cancelled: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            label: label.to_string(),
        });

        let (bulk_out, bulk_rx) = unbounded();
        let (interrupt_in, interrupt_rx) = unbounded();

        let write_timeout = settings.write_timeout();
        let worker = shared.clone();
        std::thread::Builder::new()
            .name("osrfx2-bulk-out".to_string())
            .spawn(move || run_bulk_out(worker, bulk_rx, write_timeout))?;

        let slice = settings.interrupt_poll();
        let worker = shared.clone();
        std::thread::Builder::new()
            .name("osrfx2-intr-in".to_string())
            .spawn(move || run_interrupt_in(worker, interrupt_rx, slice))?;

        Ok(Self {
            shared,
            bulk_out,
            interrupt_in,
            next_id: AtomicU64::new(1),
        })
    }

    fn queue(
        &self,
        queue: &Sender<Job>,
        endpoint: u8,
        buffer: Vec<u8>,
        sink: CompletionSink,
    ) -> Result<TransferId, TransportError> {
        let id = TransferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        queue
            .try_send(Job {
                id,
                endpoint,
                buffer,
                sink,
            })
            .map_err(|_| TransportError::NoDevice)?;
        Ok(id)
    }
}

impl Transport for RusbTransport {
    fn submit_bulk(
        &self,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.shared
            .handle
            .read_bulk(endpoint, buffer, timeout)
            .map_err(map_rusb_error)
    }

    fn submit_bulk_async(
        &self,
        endpoint: u8,
        buffer: Vec<u8>,
        sink: CompletionSink,
    ) -> Result<TransferId, TransportError> {
        self.queue(&self.bulk_out, endpoint, buffer, sink)
    }

    fn submit_interrupt_async(
        &self,
        endpoint: u8,
        buffer: Vec<u8>,
        sink: CompletionSink,
    ) -> Result<TransferId, TransportError> {
        self.queue(&self.interrupt_in, endpoint, buffer, sink)
    }

    fn cancel(&self, id: TransferId) {
        trace!("{}: cancel {}", self.shared.label, id);
        lock(&self.shared.cancelled).insert(id);
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.bulk_out.close();
        self.interrupt_in.close();
    }
}

fn run_bulk_out(shared: Arc<Shared>, jobs: Receiver<Job>, timeout: Duration) {
    while let Ok(job) = jobs.recv_blocking() {
        if lock(&shared.cancelled).remove(&job.id) {
            job.finish(TransferStatus::Cancelled, 0);
            continue;
        }

        match shared.handle.write_bulk(job.endpoint, &job.buffer, timeout) {
            Ok(written) => job.finish(TransferStatus::Completed, written),
            Err(e) => {
                debug!("{}: bulk write {} failed: {}", shared.label, job.id, e);
                job.finish(status_of(e), 0);
            }
        }
    }
    debug!("{}: bulk-out worker exiting", shared.label);
}

fn run_interrupt_in(shared: Arc<Shared>, jobs: Receiver<Job>, slice: Duration) {
    while let Ok(mut job) = jobs.recv_blocking() {
        loop {
            if shared.take_cancelled(job.id) {
                job.finish(TransferStatus::Cancelled, 0);
                break;
            }

            match shared.handle.read_interrupt(job.endpoint, &mut job.buffer, slice) {
                Ok(len) => {
                    job.finish(TransferStatus::Completed, len);
                    break;
                }
                // Nothing yet; look for a cancel and wait again
                Err(rusb::Error::Timeout) => continue,
                Err(e) => {
                    debug!("{}: interrupt receive {} failed: {}", shared.label, job.id, e);
                    job.finish(status_of(e), 0);
                    break;
                }
            }
        }
    }
    debug!("{}: interrupt worker exiting", shared.label);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), TransportError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), TransportError::Pipe);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), TransportError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::NotFound), TransportError::NotFound);
        assert!(matches!(
            map_rusb_error(rusb::Error::NotSupported),
            TransportError::Other { .. }
        ));
    }

    #[test]
    fn test_status_of() {
        assert_eq!(status_of(rusb::Error::Timeout), TransferStatus::TimedOut);
        assert_eq!(status_of(rusb::Error::Pipe), TransferStatus::Stall);
        assert_eq!(status_of(rusb::Error::NoDevice), TransferStatus::NoDevice);
        assert_eq!(status_of(rusb::Error::Overflow), TransferStatus::Overflow);
        assert_eq!(status_of(rusb::Error::Io), TransferStatus::Error);
    }
}
