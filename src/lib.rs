//! # jitspace - Executable Code Regions for JIT Runtimes
//!
//! Every compiled code object ("module") of a JIT runtime occupies a range of
//! process address space while it is alive. `jitspace` owns that range from
//! reservation to release and keeps a process-wide index of the live ranges
//! so an unwinder or a trap handler can map a program counter back to the
//! module that owns it.
//!
//! ## Features
//!
//! - **Exact lifetimes** - a region is mapped and registered for exactly as
//!   long as its module lives, then unregistered and unmapped in that order
//! - **Signal-safe lookups** - [`resolve`] takes no locks and never allocates
//! - **Shared engines** - modules keep their [`Engine`] alive; dropping the
//!   last handle in any order tears everything down
//! - **Pluggable compilers** - anything implementing [`SourceCompiler`] can
//!   feed the allocator; a small S-expression [`ModuleCompiler`] is built in
//!
//! ## Quick Start
//!
//! ```rust
//! use jitspace::{resolve, Engine, Module};
//!
//! # fn main() -> jitspace::Result<()> {
//! let engine = Engine::default();
//! let module = Module::new(
//!     &engine,
//!     r#"(module (func (export "answer") (result i32) (i32.const 42)))"#,
//! )?;
//!
//! let pc = module.function("answer").expect("exported");
//! assert_eq!(resolve(pc), Some(module.id()));
//!
//! let id = module.id();
//! drop(module);
//! assert_ne!(resolve(pc), Some(id));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Engine::compile → CompiledImage → CodeBuffer (RW) → CodeMemory (RX) → Registry::insert
//!                                                                             │
//!            drop(last Module) → Registry::remove → CodeMemory::release ◄─────┘
//! ```
//!
//! ### Main Components
//!
//! - [`memory`] - anonymous mappings, made executable once populated
//! - [`registry`] - the process-wide region index and its lock-free readers
//! - [`Module`] / [`CodeObject`] - one compiled unit and its lifecycle
//! - [`Engine`] - shared configuration, compiler and image cache
//! - [`symbolize`] - program counter to module queries
//!
//! ## Error Handling
//!
//! Fallible operations return [`Result<T>`]. [`Error::classify`] tells
//! recoverable conditions (compile errors, out of memory) apart from internal
//! invariant violations, which the lifecycle glue treats as fatal.

#![warn(missing_docs)]

/// Version of the jitspace crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod lexer;
pub mod memory;
pub mod module;
pub mod registry;
pub mod symbolize;

// Re-export main types
pub use compiler::{CompiledImage, FunctionInfo, ModuleCompiler, SourceCompiler};
pub use config::Config;
pub use engine::{Engine, EngineStats, WeakEngine};
pub use error::{CompileError, Error, ErrorSeverity, Result};
pub use lexer::{SExprScanner, Token, TokenKind};
pub use memory::{CodeBuffer, CodeMemory};
pub use module::{CodeObject, CodeState, Module, ModuleId};
pub use registry::{Region, Registry, RegistryEntry, RegistryHandle};
pub use symbolize::{resolve, resolve_symbol, Symbol};
