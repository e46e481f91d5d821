//! # Compilation contexts
//!
//! An [`Engine`] bundles a [`Config`], a [`SourceCompiler`] and a cache of
//! compiled images. It is reference counted: every [`Module`] compiled on it
//! holds a strong reference, so the engine lives until both the caller's
//! handles and all of its modules are gone. Many modules on one engine and
//! one module per engine produce the same region lifecycle.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::compiler::{CompiledImage, ModuleCompiler, SourceCompiler};
use crate::config::Config;
use crate::error::{CompileError, Error, Result};
use crate::module::Module;

/// Snapshot of an engine's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Sources handed to the compiler
    pub compilations: u64,
    /// Compilations answered from the image cache
    pub cache_hits: u64,
    /// Modules created on this engine
    pub modules_created: u64,
    /// Modules created and not yet destroyed
    pub modules_live: u64,
}

#[derive(Default)]
struct Counters {
    compilations: AtomicU64,
    cache_hits: AtomicU64,
    modules_created: AtomicU64,
    modules_destroyed: AtomicU64,
}

struct EngineInner {
    config: Config,
    compiler: Box<dyn SourceCompiler>,
    /// SHA-256 of the source → compiled image, at most `config.max_cached_images` entries
    cache: DashMap<[u8; 32], Arc<CompiledImage>>,
    counters: Counters,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        tracing::debug!(
            cached_images = self.cache.len(),
            modules = self.counters.modules_created.load(Ordering::Relaxed),
            "engine destroyed"
        );
    }
}

/// Shared compilation context
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Creates an engine with the default [`ModuleCompiler`]
    ///
    /// # Errors
    /// * [`Error::InvalidConfig`] if `config` fails validation
    pub fn new(config: &Config) -> Result<Engine> {
        Self::with_compiler(config, ModuleCompiler::new())
    }

    /// Creates an engine that compiles with `compiler`
    pub fn with_compiler(config: &Config, compiler: impl SourceCompiler + 'static) -> Result<Engine> {
        config.validate()?;
        Ok(Self::from_parts(config.clone(), Box::new(compiler)))
    }

    fn from_parts(config: Config, compiler: Box<dyn SourceCompiler>) -> Engine {
        Engine {
            inner: Arc::new(EngineInner {
                config,
                compiler,
                cache: DashMap::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Configuration this engine was created with
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// True if both handles refer to the same engine
    pub fn same(a: &Engine, b: &Engine) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Non-owning handle; does not keep the engine alive
    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Current counter values
    pub fn stats(&self) -> EngineStats {
        let c = &self.inner.counters;
        let created = c.modules_created.load(Ordering::Relaxed);
        let destroyed = c.modules_destroyed.load(Ordering::Relaxed);
        EngineStats {
            compilations: c.compilations.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            modules_created: created,
            modules_live: created.saturating_sub(destroyed),
        }
    }

    /// Compiles `source`, reusing a cached image when caching is enabled
    ///
    /// Only image bytes are shared between modules; each module still maps
    /// its own region.
    pub fn compile(&self, source: &str) -> std::result::Result<Arc<CompiledImage>, CompileError> {
        let inner = &self.inner;
        inner.counters.compilations.fetch_add(1, Ordering::Relaxed);

        if !inner.config.cache_compiled_images {
            return inner.compiler.compile(source, &inner.config).map(Arc::new);
        }

        let key: [u8; 32] = Sha256::digest(source.as_bytes()).into();
        if let Some(image) = inner.cache.get(&key) {
            inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(&image));
        }

        let image = Arc::new(inner.compiler.compile(source, &inner.config)?);
        self.make_room(&key);
        // Another thread may have compiled the same source meanwhile; keep the first
        let image = inner.cache.entry(key).or_insert(image).clone();
        Ok(image)
    }

    /// Evicts cached images until one more fits
    ///
    /// Concurrent inserts can overshoot the cap by at most one image per
    /// compiling thread.
    fn make_room(&self, incoming: &[u8; 32]) {
        let cache = &self.inner.cache;
        let cap = self.inner.config.max_cached_images;
        while cache.len() >= cap {
            // The iterator's shard lock must be released before `remove`
            let victim = cache
                .iter()
                .map(|entry| *entry.key())
                .find(|key| key != incoming);
            match victim {
                Some(key) => {
                    cache.remove(&key);
                    tracing::trace!(cached = cache.len(), "evicted compiled image");
                }
                None => break,
            }
        }
    }

    /// Compiles and maps many sources in parallel
    ///
    /// Uses a rayon pool of at most [`Config::max_parallelism`] threads. Each
    /// source yields its own result, in input order.
    ///
    /// # Errors
    /// * [`Error::ThreadPool`] if the pool cannot be created
    pub fn precompile<S>(&self, sources: &[S]) -> Result<Vec<Result<Module>>>
    where
        S: AsRef<str> + Sync,
    {
        if sources.is_empty() {
            return Ok(Vec::new());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.inner.config.max_parallelism.min(sources.len()))
            .build()
            .map_err(|e| Error::ThreadPool(e.to_string()))?;

        Ok(pool.install(|| {
            sources
                .par_iter()
                .map(|source| Module::new(self, source.as_ref()))
                .collect()
        }))
    }

    /// Drops every cached image
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    pub(crate) fn note_module_created(&self) {
        self.inner
            .counters
            .modules_created
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_module_destroyed(&self) {
        self.inner
            .counters
            .modules_destroyed
            .fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for Engine {
    fn default() -> Self {
        // The default configuration always validates
        Self::from_parts(Config::default(), Box::new(ModuleCompiler::new()))
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Weak reference to an [`Engine`]
#[derive(Clone)]
pub struct WeakEngine {
    inner: Weak<EngineInner>,
}

impl WeakEngine {
    /// The engine, if anything still holds it
    pub fn upgrade(&self) -> Option<Engine> {
        self.inner.upgrade().map(|inner| Engine { inner })
    }

    /// True once the engine has been destroyed
    pub fn is_dropped(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

impl fmt::Debug for WeakEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakEngine")
            .field("alive", &!self.is_dropped())
            .finish()
    }
}
