//! Engine configuration

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest alignment accepted for function entry points
const MAX_FUNCTION_ALIGNMENT: usize = 4096;

/// Configuration shared by every module compiled on an [`Engine`](crate::Engine)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound on the size of one compiled code image, in bytes (default: 64 MiB)
    pub max_code_size: usize,
    /// Alignment of each function's entry point inside the image (default: 16)
    pub function_alignment: usize,
    /// Reuse compiled images for identical sources on the same engine (default: true)
    ///
    /// Only the image bytes are shared; every module still gets its own region.
    pub cache_compiled_images: bool,
    /// Most images kept in an engine's cache (default: 256)
    ///
    /// Once full, an arbitrary cached image is evicted for each new one.
    pub max_cached_images: usize,
    /// Worker threads for [`Engine::precompile`](crate::Engine::precompile) (default: num_cpus)
    pub max_parallelism: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_code_size: 64 * 1024 * 1024,
            function_alignment: 16,
            cache_compiled_images: true,
            max_cached_images: 256,
            max_parallelism: num_cpus::get(),
        }
    }
}

impl Config {
    /// Creates a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("malformed JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets [`Config::max_code_size`]
    pub fn max_code_size(&mut self, bytes: usize) -> &mut Self {
        self.max_code_size = bytes;
        self
    }

    /// Sets [`Config::function_alignment`]
    pub fn function_alignment(&mut self, align: usize) -> &mut Self {
        self.function_alignment = align;
        self
    }

    /// Sets [`Config::cache_compiled_images`]
    pub fn cache_compiled_images(&mut self, enable: bool) -> &mut Self {
        self.cache_compiled_images = enable;
        self
    }

    /// Sets [`Config::max_cached_images`]
    pub fn max_cached_images(&mut self, images: usize) -> &mut Self {
        self.max_cached_images = images;
        self
    }

    /// Sets [`Config::max_parallelism`]
    pub fn max_parallelism(&mut self, threads: usize) -> &mut Self {
        self.max_parallelism = threads;
        self
    }

    /// Checks that every field is within its accepted range
    pub fn validate(&self) -> Result<()> {
        if self.max_code_size == 0 {
            return Err(Error::config("max_code_size must be non-zero"));
        }
        if !self.function_alignment.is_power_of_two()
            || self.function_alignment > MAX_FUNCTION_ALIGNMENT
        {
            return Err(Error::config(format!(
                "function_alignment must be a power of two no larger than {}, got {}",
                MAX_FUNCTION_ALIGNMENT, self.function_alignment
            )));
        }
        if self.cache_compiled_images && self.max_cached_images == 0 {
            return Err(Error::config(
                "max_cached_images must be at least 1 while caching is enabled",
            ));
        }
        if self.max_parallelism == 0 {
            return Err(Error::config("max_parallelism must be at least 1"));
        }
        Ok(())
    }
}
