//! Endpoint table
//!
//! The host hands the driver a flat list of endpoint descriptors for the
//! bound interface. This module picks the three endpoints the driver cares
//! about out of that list, once, at attach time.

use crate::error::AttachError;
use std::fmt;
use tracing::{debug, info};

/// Bit 7 of `bEndpointAddress`
const ENDPOINT_DIR_IN: u8 = 0x80;

/// Low two bits of `bmAttributes`
const ENDPOINT_XFERTYPE_MASK: u8 = 0x03;

/// Endpoint direction, from the host's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// USB transfer type of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// A single parsed endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Endpoint address including the direction bit (e.g. 0x81)
    pub address: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    /// wMaxPacketSize
    pub max_packet_size: u16,
    /// bInterval, only meaningful for interrupt endpoints
    pub interval: u8,
}

impl EndpointDescriptor {
    /// Build a descriptor from the raw `bEndpointAddress` and `bmAttributes` fields
    pub fn from_raw(address: u8, attributes: u8, max_packet_size: u16, interval: u8) -> Self {
        let direction = if address & ENDPOINT_DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        };

        let kind = match attributes & ENDPOINT_XFERTYPE_MASK {
            0 => TransferKind::Control,
            1 => TransferKind::Isochronous,
            2 => TransferKind::Bulk,
            _ => TransferKind::Interrupt,
        };

        Self {
            address,
            direction,
            kind,
            max_packet_size,
            interval,
        }
    }

    fn is(&self, kind: TransferKind, direction: Direction) -> bool {
        self.kind == kind && self.direction == direction
    }
}

/// The purpose an endpoint serves for this driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRole {
    BulkIn,
    BulkOut,
    Interrupt,
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointRole::BulkIn => "bulk-in",
            EndpointRole::BulkOut => "bulk-out",
            EndpointRole::Interrupt => "interrupt",
        };
        f.write_str(name)
    }
}

/// The endpoints selected for the read, write and notification paths
///
/// Any of them may be missing; the matching operation then fails with
/// `IoError::EndpointUnavailable` instead of failing the whole attach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointTable {
    pub bulk_in: Option<EndpointDescriptor>,
    pub bulk_out: Option<EndpointDescriptor>,
    /// Always polled as device-to-host, whatever its direction bit says.
    pub interrupt: Option<EndpointDescriptor>,
}

impl EndpointTable {
    /// Select endpoints from a descriptor list
    ///
    /// The first match wins for each role. The FX2 firmware reports its
    /// switch endpoint with an OUT-looking address, so the interrupt
    /// endpoint is matched on transfer type alone.
    pub fn from_descriptors(descriptors: &[EndpointDescriptor]) -> Result<Self, AttachError> {
        let bulk_in = descriptors
            .iter()
            .find(|ep| ep.is(TransferKind::Bulk, Direction::In))
            .copied();
        let bulk_out = descriptors
            .iter()
            .find(|ep| ep.is(TransferKind::Bulk, Direction::Out))
            .copied();
        let interrupt = descriptors
            .iter()
            .find(|ep| ep.kind == TransferKind::Interrupt)
            .copied();

        // These two back long-lived receive buffers.
        for ep in bulk_in.iter().chain(interrupt.iter()) {
            if ep.max_packet_size == 0 {
                return Err(AttachError::InvalidEndpoint {
                    address: ep.address,
                });
            }
        }

        let table = Self {
            bulk_in,
            bulk_out,
            interrupt,
        };

        for role in [
            EndpointRole::BulkIn,
            EndpointRole::BulkOut,
            EndpointRole::Interrupt,
        ] {
            match table.get(role) {
                Some(ep) => info!(
                    "{} endpoint found at {:#04x} (max packet {})",
                    role, ep.address, ep.max_packet_size
                ),
                None => debug!("No {} endpoint in descriptor set", role),
            }
        }

        Ok(table)
    }

    /// Look up the endpoint serving `role`
    pub fn get(&self, role: EndpointRole) -> Option<&EndpointDescriptor> {
        match role {
            EndpointRole::BulkIn => self.bulk_in.as_ref(),
            EndpointRole::BulkOut => self.bulk_out.as_ref(),
            EndpointRole::Interrupt => self.interrupt.as_ref(),
        }
    }

    /// Address to poll the notification endpoint on, with the IN bit forced
    pub fn interrupt_in_address(&self) -> Option<u8> {
        self.interrupt.map(|ep| ep.address | ENDPOINT_DIR_IN)
    }
}
