//! Switch-state register
//!
//! The FX2 board reports its eight DIP switches as one octet on the
//! interrupt endpoint. Bit 0 is switch 1, bit 7 is switch 8.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Number of switches on the board
pub const SWITCH_COUNT: u8 = 8;

/// Snapshot of the switch register
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SwitchState(pub u8);

impl SwitchState {
    /// Raw register value
    pub fn octet(self) -> u8 {
        self.0
    }

    /// State of switch `n` (1-based). Out-of-range switches read as off.
    pub fn is_on(self, n: u8) -> bool {
        (1..=SWITCH_COUNT).contains(&n) && self.0 & (1 << (n - 1)) != 0
    }

    pub fn sw1(self) -> bool {
        self.is_on(1)
    }

    pub fn sw2(self) -> bool {
        self.is_on(2)
    }

    pub fn sw3(self) -> bool {
        self.is_on(3)
    }

    pub fn sw4(self) -> bool {
        self.is_on(4)
    }

    pub fn sw5(self) -> bool {
        self.is_on(5)
    }

    pub fn sw6(self) -> bool {
        self.is_on(6)
    }

    pub fn sw7(self) -> bool {
        self.is_on(7)
    }

    pub fn sw8(self) -> bool {
        self.is_on(8)
    }

    /// All switches in order, sw1 first
    pub fn to_array(self) -> [bool; SWITCH_COUNT as usize] {
        std::array::from_fn(|i| self.is_on(i as u8 + 1))
    }
}

impl fmt::Display for SwitchState {
    /// Renders as `sw1..sw8` on/off markers, e.g. `[x x x x x x . .]`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marks: Vec<&str> = self
            .to_array()
            .iter()
            .map(|on| if *on { "x" } else { "." })
            .collect();
        write!(f, "[{}]", marks.join(" "))
    }
}

/// Last switch state reported by the interrupt poll
///
/// Written only from the poll loop, read by any session. The octet is a
/// single atomic so readers never see a torn update.
#[derive(Debug, Default)]
pub struct SwitchCache {
    octet: AtomicU8,
    generation: AtomicU64,
}

impl SwitchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot
    pub fn load(&self) -> SwitchState {
        SwitchState(self.octet.load(Ordering::Acquire))
    }

    /// Overwrite the snapshot with a freshly received register value
    pub fn store(&self, octet: u8) {
        self.octet.store(octet, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of updates applied so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_0x2a() {
        let state = SwitchState(0x2A);
        assert!(!state.sw1());
        assert!(state.sw2());
        assert!(!state.sw3());
        assert!(state.sw4());
        assert!(!state.sw5());
        assert!(state.sw6());
        assert!(!state.sw7());
        assert!(!state.sw8());
    }

    #[test]
    fn test_decode_low_six() {
        let state = SwitchState(0b0011_1111);
        assert_eq!(
            state.to_array(),
            [true, true, true, true, true, true, false, false]
        );
    }

    #[test]
    fn test_out_of_range_switch() {
        let state = SwitchState(0xFF);
        assert!(!state.is_on(0));
        assert!(!state.is_on(9));
        assert!(state.is_on(8));
    }

    #[test]
    fn test_display() {
        assert_eq!(SwitchState(0x81).to_string(), "[x . . . . . . x]");
        assert_eq!(SwitchState(0).to_string(), "[. . . . . . . .]");
    }

    #[test]
    fn test_cache_store_load() {
        let cache = SwitchCache::new();
        assert_eq!(cache.load(), SwitchState(0));
        assert_eq!(cache.generation(), 0);

        cache.store(0x2A);
        assert_eq!(cache.load().octet(), 0x2A);
        assert_eq!(cache.generation(), 1);

        cache.store(0x2A);
        assert_eq!(cache.generation(), 2);
    }
}
