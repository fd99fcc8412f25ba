//! Minor numbers and device node names
//!
//! Each bound device gets a minor from a small pool starting at the
//! configured base and is exposed as `usb/osrfx2<n>`, `n` counting from the
//! base. A minor goes back to the pool at teardown, not at detach, so a name
//! is never handed to a new device while sessions on the old one are open.

use std::collections::BTreeSet;
use std::fmt;

/// First minor used when the configuration does not say otherwise
pub const DEFAULT_MINOR_BASE: u32 = 192;

/// Number of minors available above the base
pub const MINOR_POOL_SIZE: u32 = 16;

/// Node name prefix under the device directory
pub const NODE_PREFIX: &str = "usb/osrfx2";

/// Minor number of a bound device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Minor(pub u32);

impl fmt::Display for Minor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub struct MinorAllocator {
    base: u32,
    in_use: BTreeSet<u32>,
}

impl MinorAllocator {
    pub fn new(base: u32) -> Self {
        Self {
            base,
            in_use: BTreeSet::new(),
        }
    }

    /// Lowest free minor, if any
    pub fn allocate(&mut self) -> Option<Minor> {
        let end = self.base.saturating_add(MINOR_POOL_SIZE);
        let minor = (self.base..end).find(|m| !self.in_use.contains(m))?;
        self.in_use.insert(minor);
        Some(Minor(minor))
    }

    /// Return a minor to the pool; `false` if it was not allocated
    pub fn free(&mut self, minor: Minor) -> bool {
        self.in_use.remove(&minor.0)
    }

    /// Node name for `minor`, e.g. `usb/osrfx20` for the base minor
    pub fn node_name(&self, minor: Minor) -> String {
        format!("{}{}", NODE_PREFIX, minor.0.saturating_sub(self.base))
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }
}

impl Default for MinorAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_MINOR_BASE)
    }
}
