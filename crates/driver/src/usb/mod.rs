//! rusb-backed host runtime
//!
//! [`RusbTransport`] implements [`crate::Transport`] over a claimed
//! `rusb::DeviceHandle`. [`UsbHost`] finds matching devices, binds them
//! through the [`crate::DeviceManager`] and follows hot-plug events.

mod host;
mod transport;

pub use host::{EventLoop, UsbHost, check_filter, identity_of};
pub use transport::{RusbTransport, map_rusb_error};
