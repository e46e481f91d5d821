use std::fmt;

use crate::module::ModuleId;

/// A half-open range of process addresses `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Region {
    /// First address of the range
    pub start: usize,
    /// One past the last address of the range
    pub end: usize,
}

impl Region {
    /// Creates a region from its bounds
    pub const fn new(start: usize, end: usize) -> Self {
        Region { start, end }
    }

    /// Creates a region from a base pointer and a length in bytes
    pub fn from_raw_parts(start: *const u8, len: usize) -> Self {
        let start = start as usize;
        Region {
            start,
            end: start.saturating_add(len),
        }
    }

    /// Number of bytes covered by the region
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// True when `start >= end`
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// True if `address` lies inside the region
    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        self.start <= address && address < self.end
    }

    /// True if the two regions share at least one address
    pub fn overlaps(&self, other: &Region) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}..{:#x}", self.start, self.end)
    }
}

/// Token returned by [`Registry::insert`](super::Registry::insert)
///
/// The serial is unique per registry, so a handle kept past its removal can
/// never match a later entry that starts at the same (reused) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistryHandle {
    pub(super) serial: u64,
    pub(super) start: usize,
}

impl RegistryHandle {
    /// Start address of the registered region
    pub fn start(&self) -> usize {
        self.start
    }
}

/// One live registration: a region and the module that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryEntry {
    /// Address range covered by the entry
    pub region: Region,
    /// Owning module
    pub owner: ModuleId,
    pub(super) serial: u64,
}

impl RegistryEntry {
    /// Handle that removes this entry
    pub fn handle(&self) -> RegistryHandle {
        RegistryHandle {
            serial: self.serial,
            start: self.region.start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_is_half_open() {
        let region = Region::new(0x1000, 0x2000);
        assert!(region.contains(0x1000));
        assert!(region.contains(0x1fff));
        assert!(!region.contains(0x2000));
        assert!(!region.contains(0xfff));
    }

    #[test]
    fn test_adjacent_regions_do_not_overlap() {
        let a = Region::new(0x1000, 0x2000);
        let b = Region::new(0x2000, 0x3000);
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
        assert!(a.overlaps(&Region::new(0x1fff, 0x2001)));
        assert!(a.overlaps(&Region::new(0x0, 0x10000)));
    }

    #[test]
    fn test_empty_region() {
        assert!(Region::new(5, 5).is_empty());
        assert!(Region::new(6, 5).is_empty());
        assert_eq!(Region::new(6, 5).len(), 0);
        assert_eq!(Region::from_raw_parts(0x10 as *const u8, 0x20).end, 0x30);
    }
}
