//! Attach/detach controller
//!
//! Binds devices reported by the host, tracks which minor each one lives
//! at, and hands out sessions. The binding map owns the controller's own
//! reference to every present device; detach simply removes it from the map
//! and lets the reference count decide when teardown happens.

use crate::device::{DeviceIdentity, DeviceParams, DeviceRef};
use crate::endpoint::{EndpointDescriptor, EndpointTable};
use crate::error::{AttachError, OpenError};
use crate::lock;
use crate::minor::{DEFAULT_MINOR_BASE, Minor, MinorAllocator};
use crate::session::Session;
use crate::transfer::CompletionQueue;
use crate::transport::Transport;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default bulk read timeout
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Knobs the controller applies to every device it binds
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    pub read_timeout: Duration,
    pub minor_base: u32,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            minor_base: DEFAULT_MINOR_BASE,
        }
    }
}

/// Summary of a bound device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundDevice {
    pub identity: DeviceIdentity,
    pub minor: Minor,
    pub node_name: String,
    pub endpoints: EndpointTable,
}

impl BoundDevice {
    fn from_device(device: &DeviceRef) -> Self {
        Self {
            identity: device.identity().clone(),
            minor: device.minor(),
            node_name: device.name().to_string(),
            endpoints: *device.endpoints(),
        }
    }
}

/// Minors of devices that have not finished teardown
#[derive(Debug)]
struct MinorPool {
    allocator: Mutex<MinorAllocator>,
    released: Condvar,
}

impl MinorPool {
    fn release(&self, minor: Minor) {
        let mut allocator = lock(&self.allocator);
        if !allocator.free(minor) {
            warn!("Minor {} released twice", minor);
        }
        self.released.notify_all();
    }
}

struct ManagerInner {
    /// The controller's reference to every present device
    bindings: Mutex<HashMap<Minor, DeviceRef>>,
    minors: Arc<MinorPool>,
    completions: CompletionQueue,
    options: ManagerOptions,
}

/// Device manager
///
/// Cheap to clone; clones share the same bindings.
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<ManagerInner>,
}

impl DeviceManager {
    /// Create a manager and start its completion worker
    pub fn new(options: ManagerOptions) -> io::Result<Self> {
        let completions = CompletionQueue::spawn()?;

        Ok(Self {
            inner: Arc::new(ManagerInner {
                bindings: Mutex::new(HashMap::new()),
                minors: Arc::new(MinorPool {
                    allocator: Mutex::new(MinorAllocator::new(options.minor_base)),
                    released: Condvar::new(),
                }),
                completions,
                options,
            }),
        })
    }

    /// Bind a newly enumerated device
    ///
    /// On success the device is present, its interrupt poll is armed and it
    /// can be opened at the returned minor. Any failure after the device
    /// state exists drops its only reference, so teardown runs before this
    /// returns.
    pub fn on_attach(
        &self,
        identity: DeviceIdentity,
        descriptors: &[EndpointDescriptor],
        transport: Arc<dyn Transport>,
    ) -> Result<BoundDevice, AttachError> {
        let mut bindings = lock(&self.inner.bindings);

        if bindings.values().any(|device| *device.identity() == identity) {
            return Err(AttachError::AlreadyBound(identity.0));
        }

        let endpoints = EndpointTable::from_descriptors(descriptors)?;

        let (minor, node_name) = {
            let mut allocator = lock(&self.inner.minors.allocator);
            let minor = allocator.allocate().ok_or(AttachError::NoMinorAvailable)?;
            (minor, allocator.node_name(minor))
        };

        let minors = self.inner.minors.clone();
        let device = DeviceRef::new(
            DeviceParams {
                identity,
                minor,
                node_name,
                endpoints,
                transport,
                completions: self.inner.completions.clone(),
                read_timeout: self.inner.options.read_timeout,
            },
            Box::new(move |minor| minors.release(minor)),
        );

        if let Err(e) = device.arm_interrupt_poll() {
            warn!("{}: could not arm interrupt poll: {}", device.name(), e);
            device.release();
            return Err(AttachError::InterruptPoll(e));
        }

        let bound = BoundDevice::from_device(&device);
        bindings.insert(minor, device);

        info!(
            "{}: device {} connected at minor {}",
            bound.node_name, bound.identity, bound.minor
        );
        Ok(bound)
    }

    /// Drop the binding of a device the host reports as gone
    ///
    /// Returns `false` if nothing was bound under `identity`. Teardown runs
    /// now if no session or write still holds the device, otherwise when the
    /// last of them lets go.
    pub fn on_detach(&self, identity: &DeviceIdentity) -> bool {
        let device = {
            let mut bindings = lock(&self.inner.bindings);
            let minor = bindings
                .iter()
                .find(|(_, device)| device.identity() == identity)
                .map(|(minor, _)| *minor);
            minor.and_then(|minor| bindings.remove(&minor))
        };

        let Some(device) = device else {
            debug!("Detach for unbound device {}", identity);
            return false;
        };

        device.mark_removed();
        info!(
            "{}: device {} disconnected ({} references outstanding)",
            device.name(),
            identity,
            device.ref_count()
        );
        device.release();
        true
    }

    /// Open a session on the device bound at `minor`
    pub fn open(&self, minor: Minor) -> Result<Session, OpenError> {
        let bindings = lock(&self.inner.bindings);
        let device = bindings.get(&minor).ok_or_else(|| {
            debug!("Open of unbound minor {}", minor);
            OpenError::NoSuchDevice(minor)
        })?;

        Ok(Session::new(device.acquire()))
    }

    /// Minor of the device bound under `identity`
    pub fn minor_of(&self, identity: &DeviceIdentity) -> Option<Minor> {
        lock(&self.inner.bindings)
            .values()
            .find(|device| device.identity() == identity)
            .map(DeviceRef::minor)
    }

    /// Devices currently bound, ordered by minor
    pub fn bound_devices(&self) -> Vec<BoundDevice> {
        let mut devices: Vec<BoundDevice> = lock(&self.inner.bindings)
            .values()
            .map(BoundDevice::from_device)
            .collect();
        devices.sort_by_key(|device| device.minor);
        devices
    }

    /// Devices that exist but have not finished teardown, bound or not
    pub fn live_devices(&self) -> usize {
        lock(&self.inner.minors.allocator).in_use()
    }

    /// Detach every bound device
    pub fn detach_all(&self) {
        let identities: Vec<DeviceIdentity> = lock(&self.inner.bindings)
            .values()
            .map(|device| device.identity().clone())
            .collect();

        for identity in identities {
            self.on_detach(&identity);
        }
    }

    /// Block until every device has been torn down or `timeout` elapses
    ///
    /// Returns `true` if nothing is left.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let allocator = lock(&self.inner.minors.allocator);
        let (allocator, _) = self
            .inner
            .minors
            .released
            .wait_timeout_while(allocator, timeout, |allocator| allocator.in_use() > 0)
            .unwrap_or_else(PoisonError::into_inner);
        allocator.in_use() == 0
    }
}
