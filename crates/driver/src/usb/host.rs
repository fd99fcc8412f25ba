//! Device discovery and hot-plug
//!
//! libusb does not allow opening a device from inside a hot-plug callback,
//! so the callback only forwards the event over a channel. The event loop
//! thread that drives `handle_events` drains that channel between calls and
//! does the actual attach and detach.

use super::transport::RusbTransport;
use crate::config::UsbSettings;
use crate::device::DeviceIdentity;
use crate::endpoint::EndpointDescriptor;
use crate::manager::{BoundDevice, DeviceManager};
use common::{Error, Result};
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long one `handle_events` call may block
const EVENT_SLICE: Duration = Duration::from_millis(100);

/// Check a VID/PID pair against "0xVID:0xPID" / "0xVID:*" filters
///
/// An empty filter list matches every device.
pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    filters.iter().any(|filter| {
        let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
            return false;
        };
        id_matches(filter_vid, vid) && id_matches(filter_pid, pid)
    })
}

fn id_matches(pattern: &str, id: u16) -> bool {
    if pattern == "*" {
        return true;
    }
    let hex = pattern.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(hex, 16).is_ok_and(|value| value == id)
}

/// Identity of a device on the bus, stable for one attachment
pub fn identity_of<T: UsbContext>(device: &Device<T>) -> DeviceIdentity {
    DeviceIdentity(format!("{}-{}", device.bus_number(), device.address()))
}

fn endpoint_from_rusb(endpoint: &rusb::EndpointDescriptor<'_>) -> EndpointDescriptor {
    let attributes = match endpoint.transfer_type() {
        rusb::TransferType::Control => 0,
        rusb::TransferType::Isochronous => 1,
        rusb::TransferType::Bulk => 2,
        rusb::TransferType::Interrupt => 3,
    };
    EndpointDescriptor::from_raw(
        endpoint.address(),
        attributes,
        endpoint.max_packet_size(),
        endpoint.interval(),
    )
}

enum HostEvent {
    Arrived(Device<Context>),
    Left(Device<Context>),
}

struct HotplugForwarder {
    events: async_channel::Sender<HostEvent>,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.events.try_send(HostEvent::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.events.try_send(HostEvent::Left(device));
    }
}

/// Binds matching USB devices to a [`DeviceManager`]
#[derive(Clone)]
pub struct UsbHost {
    context: Context,
    manager: DeviceManager,
    settings: UsbSettings,
}

impl UsbHost {
    pub fn new(manager: DeviceManager, settings: UsbSettings) -> Result<Self> {
        let context =
            Context::new().map_err(|e| Error::Usb(format!("Failed to create USB context: {}", e)))?;
        Ok(Self {
            context,
            manager,
            settings,
        })
    }

    pub fn manager(&self) -> &DeviceManager {
        &self.manager
    }

    fn matches(&self, device: &Device<Context>) -> bool {
        device.device_descriptor().is_ok_and(|descriptor| {
            check_filter(
                descriptor.vendor_id(),
                descriptor.product_id(),
                &self.settings.filters,
            )
        })
    }

    /// Bind every matching device already on the bus
    ///
    /// Devices that fail to bind are logged and skipped.
    pub fn scan(&self) -> Result<Vec<BoundDevice>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| Error::Usb(format!("Failed to enumerate devices: {}", e)))?;

        let mut bound = Vec::new();
        for device in devices.iter().filter(|device| self.matches(device)) {
            match self.attach(&device) {
                Ok(device) => bound.push(device),
                Err(e) => warn!("Skipping {}: {}", identity_of(&device), e),
            }
        }

        info!("Bound {} device(s)", bound.len());
        Ok(bound)
    }

    /// Open, claim and bind one device
    pub fn attach(&self, device: &Device<Context>) -> Result<BoundDevice> {
        let identity = identity_of(device);
        let interface = self.settings.interface;

        let mut handle = device
            .open()
            .map_err(|e| Error::Usb(format!("Failed to open {}: {}", identity, e)))?;

        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {} on {}", interface, identity);
                if let Err(e) = handle.detach_kernel_driver(interface) {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => debug!("Kernel driver state unknown for {}: {}", identity, e),
        }

        handle.claim_interface(interface).map_err(|e| {
            Error::Usb(format!(
                "Failed to claim interface {} on {}: {}",
                interface, identity, e
            ))
        })?;

        let descriptors = self.endpoint_descriptors(device, interface)?;

        // From here on the transport owns the handle and releases the interface.
        let transport = RusbTransport::new(handle, interface, &self.settings, &identity.0)?;

        self.manager
            .on_attach(identity.clone(), &descriptors, Arc::new(transport))
            .map_err(|e| Error::Usb(format!("Failed to bind {}: {}", identity, e)))
    }

    fn endpoint_descriptors(
        &self,
        device: &Device<Context>,
        interface: u8,
    ) -> Result<Vec<EndpointDescriptor>> {
        let config = device
            .active_config_descriptor()
            .map_err(|e| Error::Usb(format!("Failed to read configuration: {}", e)))?;

        let setting = config
            .interfaces()
            .find(|candidate| candidate.number() == interface)
            .and_then(|found| found.descriptors().next())
            .ok_or_else(|| Error::Usb(format!("Interface {} not found", interface)))?;

        Ok(setting
            .endpoint_descriptors()
            .map(|endpoint| endpoint_from_rusb(&endpoint))
            .collect())
    }

    /// Unbind a device that left the bus
    pub fn detach(&self, device: &Device<Context>) -> bool {
        self.manager.on_detach(&identity_of(device))
    }

    /// Start following hot-plug events on a background thread
    pub fn spawn_event_loop(&self) -> Result<EventLoop> {
        let stop = Arc::new(AtomicBool::new(false));
        let host = self.clone();
        let flag = stop.clone();

        let thread = std::thread::Builder::new()
            .name("osrfx2-usb-events".to_string())
            .spawn(move || host.run_events(&flag))?;

        Ok(EventLoop {
            stop,
            thread: Some(thread),
        })
    }

    fn run_events(&self, stop: &AtomicBool) {
        let (tx, rx) = async_channel::unbounded();

        // Held for the life of the loop; dropping it unregisters the callback
        let _registration = if rusb::has_hotplug() {
            match HotplugBuilder::new()
                .enumerate(false)
                .register(&self.context, Box::new(HotplugForwarder { events: tx }))
            {
                Ok(registration) => Some(registration),
                Err(e) => {
                    warn!("Hot-plug registration failed: {}", e);
                    None
                }
            }
        } else {
            warn!("Hot-plug not supported, only devices present at startup are bound");
            None
        };

        while !stop.load(Ordering::Acquire) {
            match self.context.handle_events(Some(EVENT_SLICE)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => debug!("USB event handling interrupted"),
                Err(e) => warn!("Error handling USB events: {}", e),
            }

            while let Ok(event) = rx.try_recv() {
                match event {
                    HostEvent::Arrived(device) if self.matches(&device) => {
                        if let Err(e) = self.attach(&device) {
                            error!("Hot-plugged device not bound: {}", e);
                        }
                    }
                    HostEvent::Arrived(_) => {}
                    HostEvent::Left(device) => {
                        self.detach(&device);
                    }
                }
            }
        }

        debug!("USB event loop exiting");
    }
}

/// Handle on the hot-plug event thread; stops it when dropped
pub struct EventLoop {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("USB event thread panicked");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
