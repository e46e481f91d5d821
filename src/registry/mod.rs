//! # Code region registry
//!
//! Process-wide index from executable address ranges to the module that
//! owns them. The runtime's unwinder and trap handler use it to attribute a
//! program counter to a module; module construction and teardown are the only
//! writers.
//!
//! ## Structure
//!
//! ```text
//!  writers ──► Mutex<Writer> (sorted Vec) ──build──► Snapshot ──publish──► AtomicPtr
//!                                                                            │
//!  readers (lookup, signal handlers) ── ReaderEpoch::enter ── binary search ◄┘
//! ```
//!
//! Writers serialize on a short `parking_lot` mutex, rebuild an immutable
//! sorted snapshot and publish it with an atomic swap. They then wait out a
//! reader grace period ([`epoch`]) before freeing the snapshot they replaced.
//! Readers never take a lock and never allocate, so [`Registry::lookup`] may
//! be called from a signal handler, including one that interrupted a writer
//! on the same thread.
//!
//! Because [`Registry::remove`] returns only after the grace period, a caller
//! that releases the region's pages after `remove` returns cannot race an
//! in-flight lookup.

mod epoch;
mod region;

pub use region::{Region, RegistryEntry, RegistryHandle};

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::module::ModuleId;
use epoch::ReaderEpoch;

/// The process-wide registry. Its index is allocated on the first insert and
/// it is never torn down.
static GLOBAL_REGISTRY: Registry = Registry::new();

/// Returns the process-wide registry
pub fn global() -> &'static Registry {
    &GLOBAL_REGISTRY
}

/// Immutable, sorted-by-start view of the live entries
struct Snapshot {
    entries: Box<[RegistryEntry]>,
}

impl Snapshot {
    #[inline]
    fn find(&self, address: usize) -> Option<&RegistryEntry> {
        let idx = self
            .entries
            .partition_point(|entry| entry.region.start <= address);
        let candidate = self.entries.get(idx.checked_sub(1)?)?;
        candidate.region.contains(address).then_some(candidate)
    }
}

struct Writer {
    /// Live entries sorted by start address; pairwise disjoint
    entries: Vec<RegistryEntry>,
    next_serial: u64,
}

/// Index of live code regions
pub struct Registry {
    writer: Mutex<Writer>,
    published: AtomicPtr<Snapshot>,
    readers: ReaderEpoch,
}

impl Registry {
    /// Creates an empty registry
    pub const fn new() -> Self {
        Registry {
            writer: parking_lot::const_mutex(Writer {
                entries: Vec::new(),
                next_serial: 1,
            }),
            published: AtomicPtr::new(ptr::null_mut()),
            readers: ReaderEpoch::new(),
        }
    }

    /// Registers `region` as owned by `owner`
    ///
    /// # Errors
    /// * [`Error::EmptyRegion`] if `region.start >= region.end`
    /// * [`Error::RangeOverlap`] if `region` intersects a live region
    pub fn insert(&self, region: Region, owner: ModuleId) -> Result<RegistryHandle> {
        if region.is_empty() {
            return Err(Error::EmptyRegion(region));
        }

        let mut writer = self.writer.lock();

        // Entries are disjoint and sorted by start, so only the two neighbours
        // of the insertion point can overlap.
        let idx = writer
            .entries
            .partition_point(|entry| entry.region.start < region.start);
        let neighbours = idx
            .checked_sub(1)
            .and_then(|prev| writer.entries.get(prev))
            .into_iter()
            .chain(writer.entries.get(idx));
        for existing in neighbours {
            if existing.region.overlaps(&region) {
                return Err(Error::RangeOverlap {
                    region,
                    existing: existing.region,
                });
            }
        }

        let serial = writer.next_serial;
        writer.next_serial += 1;
        let entry = RegistryEntry {
            region,
            owner,
            serial,
        };
        writer.entries.insert(idx, entry);
        self.publish(&writer.entries);
        let live = writer.entries.len();
        drop(writer);

        tracing::trace!(%region, %owner, live, "registered code region");
        Ok(entry.handle())
    }

    /// Removes the entry created by the `insert` call that returned `handle`
    ///
    /// When this returns, no in-flight or later [`lookup`](Self::lookup) can
    /// observe the entry.
    ///
    /// # Errors
    /// * [`Error::UnknownHandle`] if the entry was already removed
    pub fn remove(&self, handle: RegistryHandle) -> Result<()> {
        let mut writer = self.writer.lock();

        let idx = writer
            .entries
            .binary_search_by_key(&handle.start, |entry| entry.region.start)
            .ok()
            .filter(|&idx| writer.entries[idx].serial == handle.serial)
            .ok_or(Error::UnknownHandle(handle))?;

        let entry = writer.entries.remove(idx);
        self.publish(&writer.entries);
        let live = writer.entries.len();
        drop(writer);

        tracing::trace!(region = %entry.region, owner = %entry.owner, live, "unregistered code region");
        Ok(())
    }

    /// Finds the live entry whose region contains `address`
    ///
    /// Lock-free, allocation-free and async-signal-safe.
    #[inline]
    pub fn lookup(&self, address: usize) -> Option<RegistryEntry> {
        self.with_snapshot(|snapshot| snapshot.find(address).copied())
            .flatten()
    }

    /// True if the entry behind `handle` is still registered
    pub fn contains(&self, handle: RegistryHandle) -> bool {
        self.lookup(handle.start)
            .is_some_and(|entry| entry.serial == handle.serial)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.with_snapshot(|snapshot| snapshot.entries.len())
            .unwrap_or(0)
    }

    /// True if no region is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all live entries, sorted by start address
    ///
    /// Allocates; meant for diagnostics, not for the trap path.
    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.with_snapshot(|snapshot| snapshot.entries.to_vec())
            .unwrap_or_default()
    }

    #[inline]
    fn with_snapshot<R>(&self, f: impl FnOnce(&Snapshot) -> R) -> Option<R> {
        let _guard = self.readers.enter();
        let snapshot = self.published.load(Ordering::SeqCst);
        // SAFETY: A published snapshot is only freed by `publish` after a grace
        // period that waits for every reader holding a guard, including this one.
        unsafe { snapshot.as_ref() }.map(f)
    }

    /// Replace the published snapshot with a copy of `entries`
    ///
    /// Must be called with the writer lock held.
    fn publish(&self, entries: &[RegistryEntry]) {
        let next = Box::into_raw(Box::new(Snapshot {
            entries: entries.into(),
        }));
        let previous = self.published.swap(next, Ordering::SeqCst);
        self.readers.synchronize();
        if !previous.is_null() {
            // SAFETY: `previous` came from `Box::into_raw` above and the grace
            // period guarantees no reader still references it.
            drop(unsafe { Box::from_raw(previous) });
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let snapshot = *self.published.get_mut();
        if !snapshot.is_null() {
            // SAFETY: `&mut self` rules out concurrent readers.
            drop(unsafe { Box::from_raw(snapshot) });
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("live", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn owner(n: u64) -> ModuleId {
        ModuleId::from_raw(n).unwrap()
    }

    #[test]
    fn test_insert_and_lookup() {
        let registry = Registry::new();
        assert!(registry.lookup(0x1000).is_none());

        let handle = registry.insert(Region::new(0x1000, 0x2000), owner(1)).unwrap();
        let entry = registry.lookup(0x1800).unwrap();
        assert_eq!(entry.owner, owner(1));
        assert_eq!(entry.handle(), handle);
        assert!(registry.lookup(0x2000).is_none());
        assert!(registry.lookup(0xfff).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lookup_picks_the_containing_region() {
        let registry = Registry::new();
        registry.insert(Region::new(0x3000, 0x4000), owner(3)).unwrap();
        registry.insert(Region::new(0x1000, 0x2000), owner(1)).unwrap();
        registry.insert(Region::new(0x2000, 0x3000), owner(2)).unwrap();

        assert_eq!(registry.lookup(0x1000).unwrap().owner, owner(1));
        assert_eq!(registry.lookup(0x2fff).unwrap().owner, owner(2));
        assert_eq!(registry.lookup(0x3000).unwrap().owner, owner(3));
        assert!(registry.lookup(0x4000).is_none());

        let starts: Vec<usize> = registry.entries().iter().map(|e| e.region.start).collect();
        assert_eq!(starts, vec![0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn test_overlapping_insert_is_rejected() {
        let registry = Registry::new();
        registry.insert(Region::new(0x1000, 0x2000), owner(1)).unwrap();
        registry.insert(Region::new(0x3000, 0x4000), owner(2)).unwrap();

        for region in [
            Region::new(0x1800, 0x2800),
            Region::new(0x0800, 0x1001),
            Region::new(0x2fff, 0x3001),
            Region::new(0x0, 0x10000),
            Region::new(0x1000, 0x2000),
        ] {
            match registry.insert(region, owner(9)) {
                Err(Error::RangeOverlap { region: r, .. }) => assert_eq!(r, region),
                other => panic!("expected overlap for {region}, got {other:?}"),
            }
        }
        assert_eq!(registry.len(), 2);
        registry.insert(Region::new(0x2000, 0x3000), owner(3)).unwrap();
    }

    #[test]
    fn test_empty_region_is_rejected() {
        let registry = Registry::new();
        assert!(matches!(
            registry.insert(Region::new(0x1000, 0x1000), owner(1)),
            Err(Error::EmptyRegion(_))
        ));
    }

    #[test]
    fn test_remove_and_double_remove() {
        let registry = Registry::new();
        let handle = registry.insert(Region::new(0x1000, 0x2000), owner(1)).unwrap();
        assert!(registry.contains(handle));

        registry.remove(handle).unwrap();
        assert!(!registry.contains(handle));
        assert!(registry.lookup(0x1000).is_none());
        assert!(registry.is_empty());

        assert!(matches!(registry.remove(handle), Err(Error::UnknownHandle(h)) if h == handle));
    }

    #[test]
    fn test_stale_handle_does_not_remove_reused_range() {
        let registry = Registry::new();
        let stale = registry.insert(Region::new(0x1000, 0x2000), owner(1)).unwrap();
        registry.remove(stale).unwrap();

        let fresh = registry.insert(Region::new(0x1000, 0x2000), owner(2)).unwrap();
        assert_ne!(stale, fresh);
        assert!(registry.remove(stale).is_err());
        assert_eq!(registry.lookup(0x1000).unwrap().owner, owner(2));
    }

    #[test]
    fn test_concurrent_disjoint_churn() {
        const THREADS: usize = 4;
        const ITERATIONS: usize = 500;

        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let base = 0x10_0000 * (t + 1);
                    for i in 0..ITERATIONS {
                        let region = Region::new(base, base + 0x1000);
                        let id = owner((t * ITERATIONS + i + 1) as u64);
                        let handle = registry.insert(region, id).unwrap();
                        assert_eq!(registry.lookup(base + 0x10).unwrap().owner, id);
                        registry.remove(handle).unwrap();
                        assert!(registry.lookup(base + 0x10).is_none());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_global_registry_is_shared() {
        assert!(std::ptr::eq(global(), global()));
    }
}
