//! Transfer engine
//!
//! Issues the three kinds of traffic the device supports:
//! - synchronous bulk reads into a long-lived bulk-in buffer,
//! - asynchronous bulk writes from a transfer-scoped copy of the payload,
//! - the self-resubmitting interrupt poll feeding the switch cache.
//!
//! The engine owns every long-lived transfer buffer. [`TransferEngine::shutdown`]
//! releases them and is called exactly once, from device teardown.

mod completion;
mod poll;

pub use completion::CompletionQueue;
pub(crate) use completion::WriteCompletion;

use crate::device::DeviceRef;
use crate::endpoint::{EndpointRole, EndpointTable};
use crate::error::{IoError, TransportError};
use crate::lock;
use crate::switches::SwitchCache;
use crate::transport::{Completion, CompletionSink, Transport};
use poll::InterruptPoll;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

pub struct TransferEngine {
    transport: Arc<dyn Transport>,
    endpoints: EndpointTable,
    read_timeout: Duration,
    /// Sized to the bulk-in max packet size; `None` once released
    bulk_in_buffer: Mutex<Option<Vec<u8>>>,
    poll: Mutex<Option<InterruptPoll>>,
    completions: CompletionQueue,
    label: String,
}

impl TransferEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoints: EndpointTable,
        read_timeout: Duration,
        completions: CompletionQueue,
        label: &str,
    ) -> Self {
        let bulk_in_buffer = endpoints
            .bulk_in
            .map(|ep| vec![0u8; usize::from(ep.max_packet_size)]);

        Self {
            transport,
            endpoints,
            read_timeout,
            bulk_in_buffer: Mutex::new(bulk_in_buffer),
            poll: Mutex::new(None),
            completions,
            label: label.to_string(),
        }
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    /// Blocking bulk read of at most one max-size packet
    ///
    /// Copies `min(buf.len(), max packet size)` bytes at most and returns how
    /// many arrived, which may be fewer.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, IoError> {
        let endpoint = self
            .endpoints
            .bulk_in
            .ok_or(IoError::EndpointUnavailable(EndpointRole::BulkIn))?;

        if buf.is_empty() {
            return Ok(0);
        }

        let mut guard = lock(&self.bulk_in_buffer);
        let bulk_in = guard.as_mut().ok_or(IoError::DeviceGone)?;
        let len = buf.len().min(bulk_in.len());

        let count = self
            .transport
            .submit_bulk(endpoint.address, &mut bulk_in[..len], self.read_timeout)
            .map_err(|e| {
                warn!("{}: bulk read failed: {}", self.label, e);
                IoError::from(e)
            })?;

        let count = count.min(len);
        buf[..count].copy_from_slice(&bulk_in[..count]);
        debug!("{}: read {} of {} bytes", self.label, count, len);
        Ok(count)
    }

    /// Queue a bulk write and report the bytes accepted
    ///
    /// `holder` is the device reference the in-flight transfer keeps until
    /// its completion has been handled.
    pub(crate) fn write(&self, data: &[u8], holder: DeviceRef) -> Result<usize, IoError> {
        let endpoint = self
            .endpoints
            .bulk_out
            .ok_or(IoError::EndpointUnavailable(EndpointRole::BulkOut))?;

        if data.is_empty() {
            return Ok(0);
        }

        let completions = self.completions.clone();
        let sink: CompletionSink = Box::new(move |completion: Completion| {
            completions.post(WriteCompletion { completion, holder });
        });

        let id = self
            .transport
            .submit_bulk_async(endpoint.address, data.to_vec(), sink)
            .map_err(|e| {
                warn!("{}: could not submit bulk write: {}", self.label, e);
                IoError::from(e)
            })?;

        debug!(
            "{}: write {} of {} bytes submitted to endpoint {:#04x}",
            self.label,
            id,
            data.len(),
            endpoint.address
        );
        Ok(data.len())
    }

    /// Start the interrupt poll if the device has a notification endpoint
    ///
    /// Returns `Ok(false)` when there is nothing to poll.
    pub fn arm_interrupt(&self, cache: Arc<SwitchCache>) -> Result<bool, TransportError> {
        let (Some(endpoint), Some(address)) = (
            self.endpoints.interrupt,
            self.endpoints.interrupt_in_address(),
        ) else {
            debug!("{}: no interrupt endpoint, switch state unavailable", self.label);
            return Ok(false);
        };

        let mut slot = lock(&self.poll);
        if slot.is_some() {
            return Ok(true);
        }

        let poll = InterruptPoll::arm(
            self.transport.clone(),
            address,
            usize::from(endpoint.max_packet_size),
            cache,
            &self.label,
        )?;
        *slot = Some(poll);
        Ok(true)
    }

    /// Whether the interrupt poll loop is still running
    pub fn is_polling(&self) -> bool {
        lock(&self.poll).as_ref().is_some_and(|poll| poll.is_running())
    }

    /// Cancel the poll, wait for it to stop, then free the transfer buffers
    pub fn shutdown(&self) {
        let poll = lock(&self.poll).take();
        if let Some(poll) = poll {
            poll.cancel_and_wait();
        }

        if lock(&self.bulk_in_buffer).take().is_some() {
            debug!("{}: bulk-in buffer released", self.label);
        }
    }
}
