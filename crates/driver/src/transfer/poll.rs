//! Self-resubmitting interrupt poll
//!
//! One receive is always outstanding on the notification endpoint while the
//! poll is live. Each successful completion updates the switch cache and
//! puts the same buffer straight back on the wire. Cancellation is a flag
//! plus a transport cancel; [`InterruptPoll::cancel_and_wait`] returns only
//! after the loop thread has seen it and exited, so nothing is left that
//! could complete into state that is about to go away.

use crate::error::TransportError;
use crate::lock;
use crate::switches::SwitchCache;
use crate::transport::{Completion, CompletionSink, TransferId, TransferStatus, Transport};
use async_channel::{Receiver, bounded};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Default)]
struct PollState {
    cancelled: bool,
    in_flight: Option<TransferId>,
}

/// Handle on a running poll loop
pub(crate) struct InterruptPoll {
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<PollState>>,
    thread: Option<JoinHandle<()>>,
    label: String,
}

/// The loop side, moved onto the poll thread
struct Poller {
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<PollState>>,
    cache: Arc<SwitchCache>,
    endpoint: u8,
    label: String,
}

impl InterruptPoll {
    /// Submit the first receive and start the loop thread
    pub fn arm(
        transport: Arc<dyn Transport>,
        endpoint: u8,
        packet_size: usize,
        cache: Arc<SwitchCache>,
        label: &str,
    ) -> Result<Self, TransportError> {
        let state = Arc::new(Mutex::new(PollState::default()));
        let poller = Poller {
            transport: transport.clone(),
            state: state.clone(),
            cache,
            endpoint,
            label: label.to_string(),
        };

        let first = {
            let mut guard = lock(&state);
            poller.submit(&mut guard, vec![0u8; packet_size])?
        };

        let thread = std::thread::Builder::new()
            .name("osrfx2-poll".to_string())
            .spawn(move || poller.run(first))
            .map_err(|e| {
                if let Some(id) = lock(&state).in_flight.take() {
                    transport.cancel(id);
                }
                TransportError::Other {
                    message: format!("failed to spawn poll thread: {}", e),
                }
            })?;

        debug!(
            "{}: interrupt poll armed on endpoint {:#04x} ({} byte packets)",
            label, endpoint, packet_size
        );

        Ok(Self {
            transport,
            state,
            thread: Some(thread),
            label: label.to_string(),
        })
    }

    /// Stop the loop and block until its thread has exited
    pub fn cancel_and_wait(mut self) {
        let in_flight = {
            let mut state = lock(&self.state);
            state.cancelled = true;
            state.in_flight
        };

        if let Some(id) = in_flight {
            debug!("{}: cancelling interrupt transfer {}", self.label, id);
            self.transport.cancel(id);
        }

        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("{}: interrupt poll thread panicked", self.label);
        }

        debug!("{}: interrupt poll stopped", self.label);
    }

    /// Whether the loop thread is still running
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }
}

impl Poller {
    /// Queue a receive; the caller holds the state lock so a concurrent
    /// cancel sees either no transfer or this one.
    fn submit(
        &self,
        state: &mut PollState,
        buffer: Vec<u8>,
    ) -> Result<Receiver<Completion>, TransportError> {
        let (tx, rx) = bounded(1);
        let sink: CompletionSink = Box::new(move |completion: Completion| {
            let _ = tx.try_send(completion);
        });

        let id = self
            .transport
            .submit_interrupt_async(self.endpoint, buffer, sink)?;
        state.in_flight = Some(id);
        trace!("{}: interrupt transfer {} submitted", self.label, id);
        Ok(rx)
    }

    fn run(self, first: Receiver<Completion>) {
        let mut pending = first;

        loop {
            let completion = match pending.recv_blocking() {
                Ok(completion) => completion,
                Err(_) => {
                    warn!(
                        "{}: interrupt transfer dropped without completing",
                        self.label
                    );
                    break;
                }
            };

            let mut state = lock(&self.state);
            state.in_flight = None;

            match completion.status {
                TransferStatus::Completed => {
                    let valid = completion.actual_length.min(completion.buffer.len());
                    if let Some(&octet) = completion.buffer[..valid].first() {
                        self.cache.store(octet);
                        trace!("{}: switch state {:#04x}", self.label, octet);
                    } else {
                        debug!("{}: empty interrupt packet", self.label);
                    }

                    if state.cancelled {
                        break;
                    }

                    match self.submit(&mut state, completion.buffer) {
                        Ok(rx) => pending = rx,
                        Err(e) => {
                            error!(
                                "{}: interrupt transfer could not be resubmitted: {}",
                                self.label, e
                            );
                            break;
                        }
                    }
                }
                TransferStatus::Cancelled => {
                    debug!("{}: interrupt transfer {} cancelled", self.label, completion.id);
                    break;
                }
                status => {
                    error!(
                        "{}: interrupt transfer {} failed with {:?}, switch state is no longer updated",
                        self.label, completion.id, status
                    );
                    break;
                }
            }
        }
    }
}
