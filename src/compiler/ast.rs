//! Syntax tree for module source

/// Value types a function may return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValType {
    /// 32-bit integer
    I32,
    /// 64-bit integer
    I64,
}

impl ValType {
    /// Parses a value type keyword (`i32`, `i64`)
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "i32" => Some(ValType::I32),
            "i64" => Some(ValType::I64),
            _ => None,
        }
    }
}

/// Instructions accepted in function bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    /// Push a 32-bit constant
    I32Const(i32),
    /// Push a 64-bit constant
    I64Const(i64),
    /// Discard the top of the stack
    Drop,
    /// Do nothing
    Nop,
    /// Trap unconditionally
    Unreachable,
}

/// A `(func ...)` field
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuncDef {
    /// `$name`, if given
    pub id: Option<String>,
    /// Names from inline `(export "...")` clauses
    pub exports: Vec<String>,
    /// Declared result type
    pub result: Option<ValType>,
    /// Body in execution order (folded forms already flattened)
    pub body: Vec<Instr>,
}

/// A `(data ...)` field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDef {
    /// Offset into linear memory
    pub offset: u32,
    /// Concatenated string contents
    pub bytes: Vec<u8>,
}

/// A whole `(module ...)` form
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleAst {
    /// `$name` of the module, if given
    pub id: Option<String>,
    /// Minimum size of linear memory in 64 KiB pages, if a memory is declared
    pub memory_pages: Option<u32>,
    /// Export names given to the memory
    pub memory_exports: Vec<String>,
    /// Data segments in declaration order
    pub data: Vec<DataDef>,
    /// Functions in declaration order
    pub funcs: Vec<FuncDef>,
}
