//! Shared plumbing for the osrfx2 workspace
//!
//! Holds the pieces that are not specific to the driver core: the
//! application-level error type and the tracing subscriber setup used by
//! the `osrfx2` binary.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::{LOG_LEVELS, setup_logging};
