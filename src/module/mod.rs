//! # Compiled modules
//!
//! A [`Module`] is one compiled code object: a read+execute region holding
//! its image, registered in the process-wide [`registry`](crate::registry)
//! under the module's [`ModuleId`] for as long as the module lives. Modules
//! keep a strong reference to the [`Engine`] that compiled them, so an engine
//! is torn down only after its last module.
//!
//! `Module` is a cheap handle; cloning it shares the same code object. The
//! region is unregistered and then unmapped when the last handle is dropped.

mod code;

pub use code::{CodeObject, CodeState};

use std::fmt;
use std::num::NonZeroU64;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::compiler::{CompiledImage, FunctionInfo};
use crate::engine::Engine;
use crate::error::Result;
use crate::registry::{self, Region};

lazy_static! {
    /// Source of module ids; never reset, so ids are never reused
    static ref MODULE_COUNTER: AtomicU64 = AtomicU64::new(1);
}

/// Process-unique module identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleId(NonZeroU64);

impl ModuleId {
    /// Allocates a fresh id
    pub(crate) fn next() -> Self {
        let raw = MODULE_COUNTER.fetch_add(1, Ordering::Relaxed);
        // The counter starts at 1 and a u64 does not wrap in practice
        ModuleId(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Rebuilds an id from its raw value
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(ModuleId)
    }

    /// Raw value of the id
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

struct ModuleInner {
    id: ModuleId,
    code: CodeObject,
    region: Region,
    image: Arc<CompiledImage>,
    engine: Engine,
}

impl Drop for ModuleInner {
    fn drop(&mut self) {
        if let Err(err) = self.code.destroy() {
            tracing::error!(module = %self.id, error = %err, "code object teardown failed");
            panic!("code object teardown for {} failed: {}", self.id, err);
        }
        self.engine.note_module_destroyed();
    }
}

/// Installs `image`, returning recoverable errors and panicking on invariant violations
fn install_or_abort(code: &mut CodeObject, image: &[u8]) -> Result<Region> {
    match code.install(image) {
        Err(err) if err.is_invariant_violation() => {
            tracing::error!(module = %code.module(), error = %err, "code object install failed");
            panic!("code object install for {} failed: {}", code.module(), err);
        }
        result => result,
    }
}

/// A compiled, registered code object
#[derive(Clone)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

impl Module {
    /// Compiles `source` on `engine` and maps the result
    ///
    /// # Errors
    /// * [`Error::Compile`](crate::Error::Compile) if the engine's compiler rejects the source
    /// * [`Error::OutOfMemory`](crate::Error::OutOfMemory) if no region could be reserved
    ///
    /// # Panics
    /// If registration hits a registry invariant violation, e.g. an overlapping range
    pub fn new(engine: &Engine, source: &str) -> Result<Module> {
        let image = engine.compile(source)?;
        Self::instantiate(engine, image)
    }

    /// Maps an already compiled image
    pub fn from_image(engine: &Engine, image: CompiledImage) -> Result<Module> {
        Self::instantiate(engine, Arc::new(image))
    }

    fn instantiate(engine: &Engine, image: Arc<CompiledImage>) -> Result<Module> {
        let id = ModuleId::next();
        let mut code = CodeObject::new(id, registry::global());
        let region = install_or_abort(&mut code, &image.bytes)?;
        engine.note_module_created();

        Ok(Module {
            inner: Arc::new(ModuleInner {
                id,
                code,
                region,
                image,
                engine: engine.clone(),
            }),
        })
    }

    /// This module's id, as returned by [`resolve`](crate::resolve)
    pub fn id(&self) -> ModuleId {
        self.inner.id
    }

    /// Engine that compiled this module
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// The whole mapped region, page aligned
    pub fn region(&self) -> Region {
        self.inner.region
    }

    /// Address range covered by the code image itself
    ///
    /// Starts at the region start; empty for an empty image.
    pub fn image_range(&self) -> Range<usize> {
        let start = self.inner.region.start;
        start..start + self.inner.image.bytes.len()
    }

    /// The compiled image backing this module
    pub fn image(&self) -> &CompiledImage {
        &self.inner.image
    }

    /// Functions in declaration order
    pub fn functions(&self) -> &[FunctionInfo] {
        &self.inner.image.functions
    }

    /// Entry address of the function exported as `name`
    pub fn function(&self, name: &str) -> Option<usize> {
        self.inner
            .image
            .function(name)
            .map(|f| self.inner.region.start + f.offset)
    }

    /// Mapped bytes of the code image
    pub fn code(&self) -> &[u8] {
        let len = self.inner.image.bytes.len();
        self.inner.code.bytes().map_or(&[][..], |bytes| &bytes[..len])
    }

    /// True if both handles refer to the same code object
    pub fn same(a: &Module, b: &Module) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.inner.id)
            .field("region", &self.inner.region)
            .field("functions", &self.inner.image.functions.len())
            .finish()
    }
}
