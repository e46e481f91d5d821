//! # Executable code memory
//!
//! Owns the OS mappings that back compiled code. A region goes through two
//! states, encoded as two types:
//!
//! ```text
//! CodeBuffer::allocate ──► CodeBuffer (RW) ──publish──► CodeMemory (RX) ──release──► unmapped
//! ```
//!
//! Mappings are private anonymous maps rounded up to the page size, so the
//! OS never hands out two live regions that share a page. Once a
//! [`CodeMemory`] is released (or dropped) the whole range is unmapped and
//! may be reused by a later allocation.

use lazy_static::lazy_static;
use memmap2::{Mmap, MmapMut};

use crate::error::{Error, Result};
use crate::registry::Region;

lazy_static! {
    /// Page size reported by the OS
    static ref PAGE_SIZE: usize = query_page_size();
}

fn query_page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Returns the OS page size
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Round `size` up to a whole number of pages, with a minimum of one page
pub fn round_to_pages(size: usize) -> Option<usize> {
    let page = page_size();
    size.max(1).checked_add(page - 1).map(|n| n & !(page - 1))
}

/// Writable code region that has not been made executable yet
pub struct CodeBuffer {
    map: MmapMut,
}

impl CodeBuffer {
    /// Reserve a fresh read/write mapping of at least `size` bytes
    ///
    /// # Errors
    /// * [`Error::OutOfMemory`] if the size overflows or the OS refuses the mapping
    pub fn allocate(size: usize) -> Result<Self> {
        let len = round_to_pages(size).ok_or_else(|| Error::OutOfMemory {
            requested: size,
            source: std::io::Error::from_raw_os_error(libc::ENOMEM),
        })?;

        let map = MmapMut::map_anon(len).map_err(|source| Error::OutOfMemory {
            requested: len,
            source,
        })?;

        tracing::trace!(
            len,
            start = format_args!("{:#x}", map.as_ptr() as usize),
            "reserved code memory"
        );
        Ok(CodeBuffer { map })
    }

    /// Address range of the mapping
    pub fn region(&self) -> Region {
        Region::from_raw_parts(self.map.as_ptr(), self.map.len())
    }

    /// Usable size in bytes
    pub fn capacity(&self) -> usize {
        self.map.len()
    }

    /// Copy `image` to the start of the region and make the region read+execute
    ///
    /// On failure the mapping is released before returning.
    ///
    /// # Errors
    /// * [`Error::ImageTooLarge`] if `image` does not fit
    /// * [`Error::Protect`] if the protection change fails
    pub fn publish(mut self, image: &[u8]) -> Result<CodeMemory> {
        if image.len() > self.map.len() {
            return Err(Error::ImageTooLarge {
                size: image.len(),
                capacity: self.map.len(),
            });
        }
        self.map[..image.len()].copy_from_slice(image);

        let map = self
            .map
            .make_exec()
            .map_err(|source| Error::Protect { source })?;
        flush_icache(&map[..image.len()]);

        Ok(CodeMemory { map })
    }
}

/// Read+execute code region
///
/// Dropping it unmaps the range; [`CodeMemory::release`] does the same and
/// makes the release point explicit in lifecycle code.
pub struct CodeMemory {
    map: Mmap,
}

impl CodeMemory {
    /// Allocate a region sized for `image`, copy it in and make it executable
    pub fn new(image: &[u8]) -> Result<Self> {
        CodeBuffer::allocate(image.len())?.publish(image)
    }

    /// Address range of the mapping
    pub fn region(&self) -> Region {
        Region::from_raw_parts(self.map.as_ptr(), self.map.len())
    }

    /// Contents of the region
    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    /// Unmap the region
    pub fn release(self) {
        let region = self.region();
        drop(self.map);
        tracing::trace!(%region, "released code memory");
    }
}

impl std::fmt::Debug for CodeMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeMemory")
            .field("region", &self.region())
            .finish()
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
fn flush_icache(code: &[u8]) {
    extern "C" {
        fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
    }
    let range = code.as_ptr_range();
    // SAFETY: The range covers initialised bytes of a live mapping.
    unsafe {
        __clear_cache(
            range.start as *mut libc::c_char,
            range.end as *mut libc::c_char,
        )
    };
}

#[cfg(not(all(target_arch = "aarch64", target_os = "linux")))]
fn flush_icache(_code: &[u8]) {}
