//! Completion queue for asynchronous writes
//!
//! Transports call completion sinks from their own threads (a libusb event
//! loop, a worker, a test). The sinks only post onto this queue. A
//! dedicated worker thread logs the outcome and drops the transfer-scoped
//! buffer together with the device reference the write was holding, so a
//! last-reference teardown never runs on the transport's callback context.

use crate::device::DeviceRef;
use crate::transport::Completion;
use async_channel::{Receiver, Sender, unbounded};
use std::io;
use tracing::{debug, error, info, warn};

/// A finished bulk write and the device reference it kept alive
pub(crate) struct WriteCompletion {
    pub completion: Completion,
    pub holder: DeviceRef,
}

/// Sending side of the completion queue
///
/// The worker thread exits once every clone has been dropped.
#[derive(Clone)]
pub struct CompletionQueue {
    tx: Sender<WriteCompletion>,
}

impl CompletionQueue {
    /// Start the completion worker thread
    pub fn spawn() -> io::Result<Self> {
        let (tx, rx) = unbounded();

        std::thread::Builder::new()
            .name("osrfx2-completion".to_string())
            .spawn(move || run(rx))?;

        Ok(Self { tx })
    }

    /// Hand a completion to the worker
    pub(crate) fn post(&self, event: WriteCompletion) {
        if let Err(e) = self.tx.try_send(event) {
            // Worker is gone; finish the write here rather than leak the reference.
            warn!("Completion queue closed, handling write completion inline");
            handle(e.into_inner());
        }
    }
}

fn run(rx: Receiver<WriteCompletion>) {
    debug!("Completion worker started");

    while let Ok(event) = rx.recv_blocking() {
        handle(event);
    }

    debug!("Completion worker stopped");
}

fn handle(event: WriteCompletion) {
    let WriteCompletion { completion, holder } = event;

    if completion.status.is_success() {
        info!(
            "{}: write {} transferred {} bytes to the device",
            holder.name(),
            completion.id,
            completion.actual_length
        );
    } else {
        error!(
            "{}: write {} could not be transferred to the device: {:?}",
            holder.name(),
            completion.id,
            completion.status
        );
    }

    drop(completion.buffer);
    // May be the last reference after detach.
    holder.release();
}
