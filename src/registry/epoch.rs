//! Two-slot reader epoch for the registry's lock-free lookups
//!
//! Readers announce themselves in the slot selected by the current epoch's
//! parity. A writer that has just published a new snapshot bumps the epoch
//! and waits for the slot of the previous epoch to drain; after that no
//! reader can still be looking at the snapshot it replaced.
//!
//! Readers only perform atomic increments and loads, so entering and leaving
//! is async-signal-safe and never blocks. Writers must never run inside a
//! reader section on the same thread (a signal handler may read, but must
//! not mutate), otherwise `synchronize` would wait on itself.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Spins before falling back to `yield_now` while waiting for readers
const SPIN_LIMIT: u32 = 64;

pub(super) struct ReaderEpoch {
    epoch: AtomicUsize,
    active: [AtomicUsize; 2],
}

/// Marks the calling thread as a reader until dropped
pub(super) struct ReadGuard<'a> {
    slot: &'a AtomicUsize,
}

impl ReaderEpoch {
    pub(super) const fn new() -> Self {
        ReaderEpoch {
            epoch: AtomicUsize::new(0),
            active: [AtomicUsize::new(0), AtomicUsize::new(0)],
        }
    }

    /// Enter a read-side section
    #[inline]
    pub(super) fn enter(&self) -> ReadGuard<'_> {
        loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            let slot = &self.active[epoch & 1];
            slot.fetch_add(1, Ordering::SeqCst);

            // The epoch moved between the load and the increment: a writer may
            // already be past its check of this slot, so retry in the new one.
            if self.epoch.load(Ordering::SeqCst) == epoch {
                return ReadGuard { slot };
            }
            slot.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Wait until every reader that could have observed the previously
    /// published snapshot has left its read-side section
    pub(super) fn synchronize(&self) {
        let previous = self.epoch.fetch_add(1, Ordering::SeqCst);
        let slot = &self.active[previous & 1];

        let mut spins = 0;
        while slot.load(Ordering::SeqCst) != 0 {
            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    #[cfg(test)]
    fn active_readers(&self) -> usize {
        self.active[0].load(Ordering::SeqCst) + self.active[1].load(Ordering::SeqCst)
    }
}

impl Drop for ReadGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.slot.fetch_sub(1, Ordering::SeqCst);
    }
}
