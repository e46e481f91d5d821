//! # Program counter symbolication
//!
//! Read-only queries for unwinders and trap handlers. Both functions are
//! lock-free and never allocate, so they may be called from a signal
//! handler. They never log.

use crate::module::ModuleId;
use crate::registry::{self, Region};

/// A program counter attributed to a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol {
    /// Owning module
    pub module: ModuleId,
    /// The module's code region
    pub region: Region,
    /// Offset of the program counter from the region start
    pub offset: usize,
}

/// Module whose code region contains `pc`
#[inline]
pub fn resolve(pc: usize) -> Option<ModuleId> {
    registry::global().lookup(pc).map(|entry| entry.owner)
}

/// Module, region and offset for `pc`
#[inline]
pub fn resolve_symbol(pc: usize) -> Option<Symbol> {
    registry::global().lookup(pc).map(|entry| Symbol {
        module: entry.owner,
        region: entry.region,
        offset: pc - entry.region.start,
    })
}
