//! OSR USB-FX2 driver core
//!
//! Manages the lifetime of one device object per physical attachment and
//! the I/O that runs against it:
//!
//! - [`endpoint`] picks the bulk-in, bulk-out and interrupt endpoints
//! - [`transfer`] issues bulk reads, asynchronous bulk writes and the
//!   self-resubmitting switch poll
//! - [`device`] is the reference-counted handle shared by the controller,
//!   sessions and in-flight writes; the last release tears it down
//! - [`manager`] binds and unbinds devices and opens [`session`]s
//! - [`usb`] plugs real hardware in through rusb
//!
//! # Example
//!
//! ```
//! use driver::test_utils::{MockTransport, fx2_endpoints};
//! use driver::{DeviceIdentity, DeviceManager, ManagerOptions};
//! use std::sync::Arc;
//!
//! let manager = DeviceManager::new(ManagerOptions::default()).unwrap();
//! let transport = Arc::new(MockTransport::new());
//! let bound = manager
//!     .on_attach(DeviceIdentity::from("1-4"), &fx2_endpoints(), transport.clone())
//!     .unwrap();
//!
//! let mut session = manager.open(bound.minor).unwrap();
//! assert_eq!(session.write(b"hello").unwrap(), 5);
//! session.close();
//! ```

pub mod config;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod kref;
pub mod manager;
pub mod minor;
pub mod session;
pub mod switches;
pub mod test_utils;
pub mod transfer;
pub mod transport;
pub mod usb;

pub use config::DriverConfig;
pub use device::{DeviceIdentity, DeviceRef};
pub use endpoint::{Direction, EndpointDescriptor, EndpointRole, EndpointTable, TransferKind};
pub use error::{AttachError, IoError, OpenError, TransportError};
pub use manager::{BoundDevice, DeviceManager, ManagerOptions};
pub use minor::Minor;
pub use session::{Session, SessionId};
pub use switches::{SwitchCache, SwitchState};
pub use transport::{Completion, CompletionSink, TransferId, TransferStatus, Transport};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, carrying on with the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
