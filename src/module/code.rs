use crate::error::{Error, Result};
use crate::memory::{CodeBuffer, CodeMemory};
use crate::registry::{Region, Registry, RegistryHandle};

use super::ModuleId;

/// Lifecycle state of a [`CodeObject`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeState {
    /// No region reserved yet
    Uncompiled,
    /// Region mapped read+execute and registered
    Compiled,
    /// Region unregistered and unmapped
    Destroyed,
}

enum Slot {
    Uncompiled,
    Compiled {
        memory: CodeMemory,
        handle: RegistryHandle,
    },
    Destroyed,
}

/// The executable region of one module, together with its registry entry
///
/// States only move forward:
///
/// ```text
/// Uncompiled ──install──► Compiled ──destroy──► Destroyed
///      └───────────────destroy──────────────────┘
/// ```
///
/// `install` goes allocate → populate → protect → register. `destroy` goes
/// unregister → release, so no lookup can observe a region after its pages
/// are gone.
pub struct CodeObject {
    module: ModuleId,
    registry: &'static Registry,
    slot: Slot,
}

impl CodeObject {
    /// Creates an empty code object for `module` that will register in `registry`
    pub fn new(module: ModuleId, registry: &'static Registry) -> Self {
        CodeObject {
            module,
            registry,
            slot: Slot::Uncompiled,
        }
    }

    /// Owning module
    pub fn module(&self) -> ModuleId {
        self.module
    }

    /// Current lifecycle state
    pub fn state(&self) -> CodeState {
        match self.slot {
            Slot::Uncompiled => CodeState::Uncompiled,
            Slot::Compiled { .. } => CodeState::Compiled,
            Slot::Destroyed => CodeState::Destroyed,
        }
    }

    /// Maps `image` executable and registers the region
    ///
    /// If any step fails nothing stays registered and the mapping is gone.
    ///
    /// # Errors
    /// * [`Error::OutOfMemory`] / [`Error::Protect`] from the allocator
    /// * [`Error::RangeOverlap`] if the registry already holds the range
    /// * [`Error::AlreadyCompiled`] / [`Error::AlreadyDestroyed`] outside `Uncompiled`
    pub fn install(&mut self, image: &[u8]) -> Result<Region> {
        match self.slot {
            Slot::Uncompiled => {}
            Slot::Compiled { .. } => {
                return Err(Error::AlreadyCompiled {
                    module: self.module,
                })
            }
            Slot::Destroyed => {
                return Err(Error::AlreadyDestroyed {
                    module: self.module,
                })
            }
        }

        let memory = CodeBuffer::allocate(image.len())?.publish(image)?;
        let region = memory.region();
        let handle = self.registry.insert(region, self.module)?;

        tracing::debug!(module = %self.module, %region, "registered code region");
        self.slot = Slot::Compiled { memory, handle };
        Ok(region)
    }

    /// Unregisters and unmaps the region
    ///
    /// Destroying an object that never compiled just marks it destroyed.
    ///
    /// # Errors
    /// * [`Error::DoubleRelease`] if already destroyed
    /// * [`Error::UnknownHandle`] if the registry lost the entry
    pub fn destroy(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.slot, Slot::Destroyed) {
            Slot::Uncompiled => Ok(()),
            Slot::Compiled { memory, handle } => {
                let region = memory.region();
                self.registry.remove(handle)?;
                memory.release();
                tracing::debug!(module = %self.module, %region, "unregistered code region");
                Ok(())
            }
            Slot::Destroyed => Err(Error::DoubleRelease {
                module: self.module,
            }),
        }
    }

    /// Mapped region, while compiled
    pub fn region(&self) -> Option<Region> {
        match &self.slot {
            Slot::Compiled { memory, .. } => Some(memory.region()),
            _ => None,
        }
    }

    /// Registry handle, while compiled
    pub fn handle(&self) -> Option<RegistryHandle> {
        match &self.slot {
            Slot::Compiled { handle, .. } => Some(*handle),
            _ => None,
        }
    }

    /// Contents of the mapped region, while compiled
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.slot {
            Slot::Compiled { memory, .. } => Some(memory.bytes()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for CodeObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeObject")
            .field("module", &self.module)
            .field("state", &self.state())
            .field("region", &self.region())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn private_registry() -> &'static Registry {
        Box::leak(Box::new(Registry::new()))
    }

    #[test]
    fn test_install_then_destroy() {
        let registry = private_registry();
        let module = ModuleId::next();
        let mut code = CodeObject::new(module, registry);
        assert_eq!(code.state(), CodeState::Uncompiled);

        let region = code.install(&[0xc3]).unwrap();
        assert_eq!(code.state(), CodeState::Compiled);
        assert_eq!(registry.lookup(region.start).map(|e| e.owner), Some(module));
        assert_eq!(code.bytes().map(|b| b[0]), Some(0xc3));

        code.destroy().unwrap();
        assert_eq!(code.state(), CodeState::Destroyed);
        assert!(registry.lookup(region.start).is_none());
        assert!(registry.is_empty());
        assert!(code.region().is_none());
    }

    #[test]
    fn test_destroy_twice_is_double_release() {
        let mut code = CodeObject::new(ModuleId::next(), private_registry());
        code.install(&[]).unwrap();
        code.destroy().unwrap();

        let err = code.destroy().unwrap_err();
        assert!(matches!(err, Error::DoubleRelease { .. }));
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_install_into_destroyed_object() {
        let mut code = CodeObject::new(ModuleId::next(), private_registry());
        code.destroy().unwrap();
        assert!(matches!(
            code.install(&[0]),
            Err(Error::AlreadyDestroyed { .. })
        ));
    }

    #[test]
    fn test_install_twice() {
        let registry = private_registry();
        let mut code = CodeObject::new(ModuleId::next(), registry);
        code.install(&[0]).unwrap();
        assert!(matches!(
            code.install(&[0]),
            Err(Error::AlreadyCompiled { .. })
        ));
        assert_eq!(registry.len(), 1);
        code.destroy().unwrap();
    }

    #[test]
    fn test_destroy_after_lost_entry_reports_unknown_handle() {
        let registry = private_registry();
        let mut code = CodeObject::new(ModuleId::next(), registry);
        code.install(&[0]).unwrap();
        registry.remove(code.handle().unwrap()).unwrap();

        assert!(matches!(code.destroy(), Err(Error::UnknownHandle(_))));
    }
}
