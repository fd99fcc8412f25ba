//! Atomic reference counter with a single zero transition
//!
//! `Kref` only counts. Whoever observes `put` returning `true` owns the
//! release path, and that can happen once per counter.

use std::sync::atomic::{AtomicUsize, Ordering, fence};

#[derive(Debug)]
pub struct Kref {
    count: AtomicUsize,
}

impl Kref {
    /// New counter holding the creator's reference
    pub fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
        }
    }

    /// Take another reference on behalf of a caller that already holds one
    ///
    /// # Panics
    ///
    /// If the count is already zero. That means the release path has
    /// started and the caller broke the reference discipline.
    pub fn get(&self) {
        let prev = self.count.fetch_add(1, Ordering::Relaxed);
        assert!(prev != 0, "kref: get() on a released object");
    }

    /// Drop a reference, returning `true` for the caller that drops the last one
    ///
    /// # Panics
    ///
    /// On underflow.
    pub fn put(&self) -> bool {
        let prev = self.count.fetch_sub(1, Ordering::Release);
        assert!(prev != 0, "kref: put() on a released object");
        if prev != 1 {
            return false;
        }
        // Pairs with the Release above on every other holder's put.
        fence(Ordering::Acquire);
        true
    }

    /// Current count; only a hint while other threads hold references
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

impl Default for Kref {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_single_reference() {
        let kref = Kref::new();
        assert_eq!(kref.count(), 1);
        assert!(kref.put());
        assert_eq!(kref.count(), 0);
    }

    #[test]
    #[should_panic(expected = "get() on a released object")]
    fn test_get_after_release_panics() {
        let kref = Kref::new();
        assert!(kref.put());
        kref.get();
    }

    #[test]
    #[should_panic(expected = "put() on a released object")]
    fn test_put_underflow_panics() {
        let kref = Kref::new();
        kref.put();
        kref.put();
    }

    #[test]
    fn test_concurrent_put_single_release() {
        let kref = Arc::new(Kref::new());
        let releases = Arc::new(AtomicUsize::new(0));
        let threads = 8;
        let per_thread = 1000;

        for _ in 0..threads * per_thread {
            kref.get();
        }

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let kref = kref.clone();
                let releases = releases.clone();
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        if kref.put() {
                            releases.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(releases.load(Ordering::SeqCst), 0);
        assert!(kref.put());
    }

    proptest! {
        /// Interleave gets and puts from a live reference; the zero
        /// transition is seen once, and only when puts catch up with gets.
        #[test]
        fn prop_release_once_when_balanced(ops in proptest::collection::vec(any::<bool>(), 0..64)) {
            let kref = Kref::new();
            let mut held = 1usize;
            let mut releases = 0usize;

            for get in ops {
                if get {
                    kref.get();
                    held += 1;
                } else if held > 1 {
                    prop_assert!(!kref.put());
                    held -= 1;
                }
                prop_assert_eq!(kref.count(), held);
            }

            while held > 0 {
                if kref.put() {
                    releases += 1;
                    prop_assert_eq!(held, 1);
                }
                held -= 1;
            }

            prop_assert_eq!(releases, 1);
        }
    }
}
