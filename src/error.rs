//! Error types for jitspace

use thiserror::Error;

use crate::module::ModuleId;
use crate::registry::{Region, RegistryHandle};

/// Errors produced while turning module source text into a code image
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// Syntax error encountered while scanning
    ///
    /// **Triggered by:** Unterminated strings, stray characters, malformed numbers
    /// **Example:** `(module (data "abc))`
    #[error("Syntax error at line {line}, column {col}: {message}")]
    Syntax {
        /// Line number where error occurred
        line: usize,
        /// Column number where error occurred
        col: usize,
        /// Error description
        message: String,
    },

    /// Unexpected token encountered while parsing
    #[error("Unexpected token at line {line}: expected {expected}, got {got}")]
    UnexpectedToken {
        /// Expected token description
        expected: String,
        /// Actual token received
        got: String,
        /// Line number of the offending token
        line: usize,
    },

    /// Unexpected end of input
    #[error("Unexpected end of file")]
    UnexpectedEof,

    /// Well-formed input that does not describe a valid module
    ///
    /// **Triggered by:** Duplicate exports, a function declaring a result but
    /// leaving nothing on the stack, out-of-range constants
    #[error("Validation error: {0}")]
    Validation(String),

    /// The laid-out image exceeds `Config::max_code_size`
    #[error("Code image of {size} bytes exceeds the limit of {limit} bytes")]
    ImageTooLarge {
        /// Size of the laid-out image
        size: usize,
        /// Configured limit
        limit: usize,
    },
}

/// jitspace errors
#[derive(Error, Debug)]
pub enum Error {
    // Caller-facing errors
    /// The source compiler rejected the input; surfaced verbatim
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// The OS refused to reserve memory for a code region
    ///
    /// **Recovery:** Classified as Recoverable - the caller may retry once
    /// other modules have been dropped.
    #[error("Out of memory reserving {requested} bytes of code memory: {source}")]
    OutOfMemory {
        /// Number of bytes requested
        requested: usize,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Changing a code region to read+execute failed
    #[error("Failed to make code memory executable: {source}")]
    Protect {
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Configuration rejected by `Config::validate`
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Building the rayon pool for parallel compilation failed
    #[error("Failed to create thread pool: {0}")]
    ThreadPool(String),

    // Invariant violations
    /// An image was written into a mapping that is too small for it
    #[error("Image of {size} bytes does not fit a {capacity} byte code region")]
    ImageTooLarge {
        /// Image size in bytes
        size: usize,
        /// Mapping capacity in bytes
        capacity: usize,
    },

    /// A region was registered on top of a live one
    ///
    /// **Triggered by:** An allocator handing out a range that is still in use,
    /// or a stale entry that was never unregistered.
    #[error("Region {region} overlaps live region {existing}")]
    RangeOverlap {
        /// Region being inserted
        region: Region,
        /// Live region it collides with
        existing: Region,
    },

    /// A region with `start >= end` was passed to the registry
    #[error("Empty region {0}")]
    EmptyRegion(Region),

    /// Removal of a handle the registry does not hold
    #[error("Unknown registry handle {0:?}")]
    UnknownHandle(RegistryHandle),

    /// A code object was torn down twice
    #[error("Code object for module {module} released twice")]
    DoubleRelease {
        /// Module whose code object was released again
        module: ModuleId,
    },

    /// A second image was installed into a code object
    #[error("Code object for module {module} already holds compiled code")]
    AlreadyCompiled {
        /// Module whose code object was installed into twice
        module: ModuleId,
    },

    /// Attempt to install code into an object that was already destroyed
    #[error("Code object for module {module} is already destroyed")]
    AlreadyDestroyed {
        /// Module that was destroyed
        module: ModuleId,
    },
}

/// Error severity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Internal invariant violation; the lifecycle glue aborts on these
    Fatal,
    /// Condition the caller can handle, e.g. by retrying later
    Recoverable,
}

impl Error {
    /// Create an invalid-configuration error with a message
    pub fn config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }

    /// Classify error severity
    pub fn classify(&self) -> ErrorSeverity {
        match self {
            Error::RangeOverlap { .. } => ErrorSeverity::Fatal,
            Error::EmptyRegion(_) => ErrorSeverity::Fatal,
            Error::UnknownHandle(_) => ErrorSeverity::Fatal,
            Error::DoubleRelease { .. } => ErrorSeverity::Fatal,
            Error::AlreadyCompiled { .. } => ErrorSeverity::Fatal,
            Error::AlreadyDestroyed { .. } => ErrorSeverity::Fatal,
            Error::ImageTooLarge { .. } => ErrorSeverity::Fatal,

            Error::Compile(_) => ErrorSeverity::Recoverable,
            Error::OutOfMemory { .. } => ErrorSeverity::Recoverable,
            Error::Protect { .. } => ErrorSeverity::Recoverable,
            Error::InvalidConfig(_) => ErrorSeverity::Recoverable,
            Error::ThreadPool(_) => ErrorSeverity::Recoverable,
        }
    }

    /// True for errors that indicate a bug in the allocator or lifecycle glue
    pub fn is_invariant_violation(&self) -> bool {
        self.classify() == ErrorSeverity::Fatal
    }
}

/// Result type for jitspace operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_errors_are_recoverable() {
        let err: Error = CompileError::UnexpectedEof.into();
        assert_eq!(err.classify(), ErrorSeverity::Recoverable);
        assert_eq!(err.to_string(), "Unexpected end of file");
    }

    #[test]
    fn test_registry_errors_are_fatal() {
        let region = Region::new(0x1000, 0x2000);
        let err = Error::RangeOverlap {
            region,
            existing: Region::new(0x1800, 0x3000),
        };
        assert!(err.is_invariant_violation());
        assert!(err.to_string().contains("0x1000..0x2000"));
    }

    #[test]
    fn test_out_of_memory_keeps_source() {
        let err = Error::OutOfMemory {
            requested: 4096,
            source: std::io::Error::from_raw_os_error(libc::ENOMEM),
        };
        assert_eq!(err.classify(), ErrorSeverity::Recoverable);
        assert!(std::error::Error::source(&err).is_some());
    }
}
