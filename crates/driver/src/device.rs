//! Reference-counted device handle
//!
//! Every holder of the device (the controller's binding, each open session,
//! each in-flight write) owns one [`DeviceRef`]. Cloning a `DeviceRef`
//! acquires a reference and dropping it releases one. The holder that
//! releases the last reference runs teardown: the interrupt poll is
//! cancelled and waited for, the transfer buffers are freed, and the
//! controller's teardown hook returns the minor number.

use crate::endpoint::EndpointTable;
use crate::error::{IoError, TransportError};
use crate::kref::Kref;
use crate::lock;
use crate::minor::Minor;
use crate::switches::{SwitchCache, SwitchState};
use crate::transfer::{CompletionQueue, TransferEngine};
use crate::transport::Transport;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Opaque identity of a physical attachment, assigned by the host
///
/// The rusb backend uses `"<bus>-<address>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(pub String);

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Called once from teardown with the device's minor number
pub type TeardownHook = Box<dyn FnOnce(Minor) + Send + 'static>;

/// Everything needed to bring up a device
pub struct DeviceParams {
    pub identity: DeviceIdentity,
    pub minor: Minor,
    pub node_name: String,
    pub endpoints: EndpointTable,
    pub transport: Arc<dyn Transport>,
    pub completions: CompletionQueue,
    pub read_timeout: Duration,
}

struct DeviceInner {
    kref: Kref,
    identity: DeviceIdentity,
    minor: Minor,
    name: String,
    /// Cleared at detach; no new transfers afterwards
    present: AtomicBool,
    torn_down: AtomicBool,
    switches: Arc<SwitchCache>,
    engine: TransferEngine,
    on_teardown: Mutex<Option<TeardownHook>>,
}

/// One counted reference to a device
pub struct DeviceRef {
    inner: Arc<DeviceInner>,
}

impl DeviceRef {
    /// Create a device holding a single reference, owned by the caller
    pub fn new(params: DeviceParams, on_teardown: TeardownHook) -> Self {
        let engine = TransferEngine::new(
            params.transport,
            params.endpoints,
            params.read_timeout,
            params.completions,
            &params.node_name,
        );

        debug!(
            "{}: device state created for {} (minor {})",
            params.node_name, params.identity, params.minor
        );

        Self {
            inner: Arc::new(DeviceInner {
                kref: Kref::new(),
                identity: params.identity,
                minor: params.minor,
                name: params.node_name,
                present: AtomicBool::new(true),
                torn_down: AtomicBool::new(false),
                switches: Arc::new(SwitchCache::new()),
                engine,
                on_teardown: Mutex::new(Some(on_teardown)),
            }),
        }
    }

    /// Take another reference
    ///
    /// # Panics
    ///
    /// If teardown has already started, which cannot happen while `self`
    /// is a live reference unless the count was corrupted.
    pub fn acquire(&self) -> DeviceRef {
        self.inner.kref.get();
        DeviceRef {
            inner: self.inner.clone(),
        }
    }

    /// Give this reference back; the last one runs teardown
    pub fn release(self) {
        drop(self);
    }

    /// Number of outstanding references
    pub fn ref_count(&self) -> usize {
        self.inner.kref.count()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    pub fn minor(&self) -> Minor {
        self.inner.minor
    }

    /// Device node name, e.g. `usb/osrfx20`
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn endpoints(&self) -> &EndpointTable {
        self.inner.engine.endpoints()
    }

    /// Whether the physical device is still attached
    pub fn is_present(&self) -> bool {
        self.inner.present.load(Ordering::Acquire)
    }

    /// Latest switch state reported by the interrupt poll
    pub fn switches(&self) -> SwitchState {
        self.inner.switches.load()
    }

    /// Number of switch updates received so far
    pub fn switch_generation(&self) -> u64 {
        self.inner.switches.generation()
    }

    /// Whether the interrupt poll is still running
    pub fn is_polling(&self) -> bool {
        self.inner.engine.is_polling()
    }

    /// Blocking bulk read, see [`TransferEngine::read`]
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, IoError> {
        if !self.is_present() {
            return Err(IoError::DeviceGone);
        }
        self.inner.engine.read(buf)
    }

    /// Queue a bulk write; the in-flight transfer holds its own reference
    pub fn write(&self, data: &[u8]) -> Result<usize, IoError> {
        if data.is_empty() {
            return Ok(0);
        }
        if !self.is_present() {
            return Err(IoError::DeviceGone);
        }
        self.inner.engine.write(data, self.acquire())
    }

    /// Start the switch poll; no-op without an interrupt endpoint
    pub(crate) fn arm_interrupt_poll(&self) -> Result<bool, TransportError> {
        self.inner.engine.arm_interrupt(self.inner.switches.clone())
    }

    /// Mark the physical device gone; in-flight transfers are left alone
    pub(crate) fn mark_removed(&self) {
        self.inner.present.store(false, Ordering::Release);
    }
}

impl Clone for DeviceRef {
    fn clone(&self) -> Self {
        self.acquire()
    }
}

impl Drop for DeviceRef {
    fn drop(&mut self) {
        if self.inner.kref.put() {
            self.inner.teardown();
        }
    }
}

impl fmt::Debug for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRef")
            .field("name", &self.inner.name)
            .field("identity", &self.inner.identity)
            .field("refs", &self.inner.kref.count())
            .field("present", &self.is_present())
            .finish()
    }
}

impl DeviceInner {
    fn teardown(&self) {
        let already = self.torn_down.swap(true, Ordering::AcqRel);
        assert!(!already, "{}: teardown ran twice", self.name);

        self.present.store(false, Ordering::Release);
        self.engine.shutdown();

        if let Some(hook) = lock(&self.on_teardown).take() {
            hook(self.minor);
        }

        info!("{}: device state released", self.name);
    }
}
