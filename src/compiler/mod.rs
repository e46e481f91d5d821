//! # Module compiler
//!
//! Produces the native code images that the rest of the crate maps, registers
//! and tears down. The default [`ModuleCompiler`] accepts a small
//! WebAssembly-text-flavoured S-expression format:
//!
//! ```text
//! (module $name?
//!   (memory 1)
//!   (data (i32.const 0) "bytes")
//!   (func $f (export "f") (result i32)
//!     (i32.const 42)))
//! ```
//!
//! ## Pipeline
//!
//! ```text
//! source → SExprScanner → ModuleParser → validate → native stubs → CompiledImage
//! ```
//!
//! Any other producer of executable bytes can be plugged into an
//! [`Engine`](crate::Engine) by implementing [`SourceCompiler`].

pub mod ast;
pub mod codegen;
pub mod parser;

pub use codegen::Target;
pub use parser::ModuleParser;

use std::ops::Range;

use crate::config::Config;
use crate::error::CompileError;
use crate::lexer::SExprScanner;

/// Turns source text into a native code image
pub trait SourceCompiler: Send + Sync {
    /// Compile `source` under `config`
    fn compile(&self, source: &str, config: &Config) -> Result<CompiledImage, CompileError>;
}

/// Location of one function inside a [`CompiledImage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    /// `$name` from the source, if any
    pub name: Option<String>,
    /// Export names
    pub exports: Vec<String>,
    /// Byte offset of the entry point from the start of the image
    pub offset: usize,
    /// Length of the function's code in bytes
    pub len: usize,
}

impl FunctionInfo {
    /// Byte range of the function inside the image
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Location of one data segment inside a [`CompiledImage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSegmentInfo {
    /// Offset in linear memory the segment initialises
    pub memory_offset: u32,
    /// Offset of the segment bytes from the start of the image
    pub image_offset: usize,
    /// Segment length in bytes
    pub len: usize,
}

/// Output of a [`SourceCompiler`]: position-independent code plus metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledImage {
    /// Text followed by data
    pub bytes: Vec<u8>,
    /// Functions in declaration order
    pub functions: Vec<FunctionInfo>,
    /// Data segments in declaration order
    pub data: Vec<DataSegmentInfo>,
    /// Length of the text section; data starts at or after this offset
    pub text_len: usize,
    /// Declared linear memory size in 64 KiB pages
    pub memory_pages: Option<u32>,
}

impl CompiledImage {
    /// Image made of raw bytes with no function or data metadata
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        CompiledImage {
            text_len: bytes.len(),
            bytes,
            ..CompiledImage::default()
        }
    }

    /// Function exported under `name`
    pub fn function(&self, name: &str) -> Option<&FunctionInfo> {
        self.functions
            .iter()
            .find(|f| f.exports.iter().any(|e| e == name))
    }
}

/// Default compiler for S-expression module text
#[derive(Debug, Clone, Copy)]
pub struct ModuleCompiler {
    target: Target,
}

impl ModuleCompiler {
    /// Compiler emitting code for the running process
    pub fn new() -> Self {
        Self::for_target(Target::host())
    }

    /// Compiler emitting code for `target`
    pub fn for_target(target: Target) -> Self {
        ModuleCompiler { target }
    }

    /// Target this compiler emits for
    pub fn target(&self) -> Target {
        self.target
    }
}

impl Default for ModuleCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceCompiler for ModuleCompiler {
    fn compile(&self, source: &str, config: &Config) -> Result<CompiledImage, CompileError> {
        // Phase 1: Scan
        let mut scanner = SExprScanner::new(source);
        let tokens = scanner.scan_tokens()?;

        // Phase 2: Parse
        let mut parser = ModuleParser::new(tokens);
        let module = parser.parse()?;

        // Phase 3: Validate and lay out
        let image = codegen::generate(&module, config, self.target)?;

        tracing::debug!(
            module = module.id.as_deref().unwrap_or("<anonymous>"),
            functions = image.functions.len(),
            size = image.bytes.len(),
            "compiled module"
        );
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_exported_function() {
        let compiler = ModuleCompiler::for_target(Target::X86_64);
        let image = compiler
            .compile(
                r#"(module (func (export "answer") (result i32) (i32.const 42)))"#,
                &Config::default(),
            )
            .unwrap();

        let answer = image.function("answer").unwrap();
        assert_eq!(answer.offset, 0);
        assert_eq!(&image.bytes[answer.range()], &[0xb8, 42, 0, 0, 0, 0xc3]);
        assert!(image.function("missing").is_none());
    }

    #[test]
    fn test_data_only_module() {
        let image = ModuleCompiler::new()
            .compile(
                r#"(module (memory 1) (data (i32.const 0) "a"))"#,
                &Config::default(),
            )
            .unwrap();
        assert_eq!(image.text_len, 0);
        assert_eq!(image.bytes, b"a");
        assert_eq!(image.memory_pages, Some(1));
    }

    #[test]
    fn test_errors_surface_unchanged() {
        let compiler = ModuleCompiler::new();
        assert!(matches!(
            compiler.compile("(module (data \"x", &Config::default()),
            Err(CompileError::Syntax { .. })
        ));
        assert!(matches!(
            compiler.compile("(module (data \"x\"))", &Config::default()),
            Err(CompileError::Validation(_))
        ));
    }

    #[test]
    fn test_from_bytes() {
        let image = CompiledImage::from_bytes(vec![0xc3]);
        assert_eq!(image.text_len, 1);
        assert!(image.functions.is_empty());
    }
}
