//! Client sessions
//!
//! A session is what an open file handle on the device node maps to. It
//! owns one device reference from open until close; `read` and `write` take
//! `&mut self`, so one session never has two transfers of its own racing
//! on the bulk-in buffer.

use crate::device::DeviceRef;
use crate::error::IoError;
use crate::switches::SwitchState;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session number, for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    device: DeviceRef,
}

impl Session {
    /// Wrap a reference the caller already acquired for this session
    pub(crate) fn new(device: DeviceRef) -> Self {
        let id = SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed));
        info!("{}: device opened (session {})", device.name(), id.0);
        Self { id, device }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    /// Read up to `buf.len()` bytes, capped at one bulk-in packet
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        self.device.read(buf)
    }

    /// Queue `data` for transmission and return the bytes accepted
    pub fn write(&mut self, data: &[u8]) -> Result<usize, IoError> {
        self.device.write(data)
    }

    /// Latest switch state
    pub fn switches(&self) -> SwitchState {
        self.device.switches()
    }

    /// Release the session's device reference
    pub fn close(self) {}
}

impl Drop for Session {
    fn drop(&mut self) {
        info!("{}: device closed (session {})", self.device.name(), self.id.0);
    }
}
