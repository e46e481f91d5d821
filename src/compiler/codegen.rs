//! Validation and native stub emission
//!
//! Every function body in the accepted subset is straight-line code over
//! constants, so its behaviour is known at compile time: it either traps or
//! returns a constant (or nothing). Each function is lowered to the shortest
//! native sequence with that behaviour.

use std::collections::HashSet;

use super::ast::{FuncDef, Instr, ModuleAst, ValType};
use super::{CompiledImage, DataSegmentInfo, FunctionInfo};
use crate::config::Config;
use crate::error::CompileError;

/// Size of one page of linear memory
pub const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// Alignment of the data area that follows the text
const DATA_ALIGNMENT: usize = 16;

/// Instruction set to emit stubs for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// x86-64 (System V and Windows share the return register)
    X86_64,
    /// AArch64
    Aarch64,
    /// Anything else; every function becomes a trap
    Other,
}

impl Target {
    /// Target of the running process
    pub fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            Target::X86_64
        } else if cfg!(target_arch = "aarch64") {
            Target::Aarch64
        } else {
            Target::Other
        }
    }

    /// Byte used to pad between functions
    fn padding(self) -> u8 {
        match self {
            // int3
            Target::X86_64 => 0xcc,
            // udf #0 is all zeroes
            Target::Aarch64 | Target::Other => 0x00,
        }
    }
}

/// What a function does when called
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Return,
    ReturnI32(i32),
    ReturnI64(i64),
    Trap,
}

/// Validates `module` and lays it out as a native image
pub fn generate(
    module: &ModuleAst,
    config: &Config,
    target: Target,
) -> Result<CompiledImage, CompileError> {
    validate_module(module)?;

    let mut bytes = Vec::new();
    let mut functions = Vec::with_capacity(module.funcs.len());

    for func in &module.funcs {
        let behavior = validate_func(func)?;
        pad_to(&mut bytes, config.function_alignment, target.padding());
        let offset = bytes.len();
        emit(&mut bytes, behavior, target);
        functions.push(FunctionInfo {
            name: func.id.clone(),
            exports: func.exports.clone(),
            offset,
            len: bytes.len() - offset,
        });
    }
    let text_len = bytes.len();

    let mut data = Vec::with_capacity(module.data.len());
    if !module.data.is_empty() {
        pad_to(&mut bytes, DATA_ALIGNMENT, 0);
    }
    for segment in &module.data {
        data.push(DataSegmentInfo {
            memory_offset: segment.offset,
            image_offset: bytes.len(),
            len: segment.bytes.len(),
        });
        bytes.extend_from_slice(&segment.bytes);
    }

    if bytes.len() > config.max_code_size {
        return Err(CompileError::ImageTooLarge {
            size: bytes.len(),
            limit: config.max_code_size,
        });
    }

    Ok(CompiledImage {
        bytes,
        functions,
        data,
        text_len,
        memory_pages: module.memory_pages,
    })
}

fn validate_module(module: &ModuleAst) -> Result<(), CompileError> {
    let mut seen = HashSet::new();
    let func_exports = module.funcs.iter().flat_map(|f| f.exports.iter());
    for name in module.memory_exports.iter().chain(func_exports) {
        if !seen.insert(name.as_str()) {
            return Err(CompileError::Validation(format!(
                "duplicate export name \"{}\"",
                name
            )));
        }
    }

    if module.data.is_empty() {
        return Ok(());
    }
    let pages = module.memory_pages.ok_or_else(|| {
        CompileError::Validation("data segment declared without a memory".to_string())
    })?;
    let memory_size = u64::from(pages) * WASM_PAGE_SIZE;
    for segment in &module.data {
        let end = u64::from(segment.offset) + segment.bytes.len() as u64;
        if end > memory_size {
            return Err(CompileError::Validation(format!(
                "data segment at offset {} with {} bytes does not fit a memory of {} pages",
                segment.offset,
                segment.bytes.len(),
                pages
            )));
        }
    }
    Ok(())
}

/// Type-checks the body and works out what the function does
fn validate_func(func: &FuncDef) -> Result<Behavior, CompileError> {
    let name = func.id.as_deref().unwrap_or("<anonymous>");
    let mut stack: Vec<(ValType, i64)> = Vec::new();
    // After `unreachable` the operand stack is polymorphic
    let mut unreachable = false;

    for instr in &func.body {
        match *instr {
            Instr::I32Const(v) => stack.push((ValType::I32, i64::from(v))),
            Instr::I64Const(v) => stack.push((ValType::I64, v)),
            Instr::Nop => {}
            Instr::Unreachable => {
                unreachable = true;
                stack.clear();
            }
            Instr::Drop => {
                if stack.pop().is_none() && !unreachable {
                    return Err(CompileError::Validation(format!(
                        "function {}: drop on an empty stack",
                        name
                    )));
                }
            }
        }
    }

    let expected = func.result.map_or(0, |_| 1);
    if stack.len() > expected || (stack.len() < expected && !unreachable) {
        return Err(CompileError::Validation(format!(
            "function {}: expected {} result value(s), found {}",
            name,
            expected,
            stack.len()
        )));
    }
    if let (Some(result), Some(&(ty, _))) = (func.result, stack.last()) {
        if ty != result {
            return Err(CompileError::Validation(format!(
                "function {}: result type mismatch, expected {:?} found {:?}",
                name, result, ty
            )));
        }
    }

    let behavior = if unreachable {
        Behavior::Trap
    } else {
        match (func.result, stack.last()) {
            (Some(ValType::I32), Some(&(_, v))) => Behavior::ReturnI32(v as i32),
            (Some(ValType::I64), Some(&(_, v))) => Behavior::ReturnI64(v),
            _ => Behavior::Return,
        }
    };
    Ok(behavior)
}

fn pad_to(bytes: &mut Vec<u8>, align: usize, fill: u8) {
    let aligned = bytes.len().next_multiple_of(align.max(1));
    bytes.resize(aligned, fill);
}

fn emit(bytes: &mut Vec<u8>, behavior: Behavior, target: Target) {
    match target {
        Target::X86_64 => emit_x86_64(bytes, behavior),
        Target::Aarch64 => emit_aarch64(bytes, behavior),
        Target::Other => bytes.extend_from_slice(&[0u8; 4]),
    }
}

fn emit_x86_64(bytes: &mut Vec<u8>, behavior: Behavior) {
    const RET: u8 = 0xc3;
    match behavior {
        Behavior::Return => bytes.push(RET),
        Behavior::ReturnI32(v) => {
            // mov eax, imm32
            bytes.push(0xb8);
            bytes.extend_from_slice(&v.to_le_bytes());
            bytes.push(RET);
        }
        Behavior::ReturnI64(v) => {
            // movabs rax, imm64
            bytes.extend_from_slice(&[0x48, 0xb8]);
            bytes.extend_from_slice(&v.to_le_bytes());
            bytes.push(RET);
        }
        // ud2
        Behavior::Trap => bytes.extend_from_slice(&[0x0f, 0x0b]),
    }
}

fn emit_aarch64(bytes: &mut Vec<u8>, behavior: Behavior) {
    const RET: u32 = 0xd65f_03c0;
    const UDF: u32 = 0x0000_0000;

    let mut push = |word: u32| bytes.extend_from_slice(&word.to_le_bytes());
    match behavior {
        Behavior::Return => push(RET),
        Behavior::ReturnI32(v) => {
            let v = v as u32;
            // movz w0, #lo ; movk w0, #hi, lsl #16
            push(0x5280_0000 | ((v & 0xffff) << 5));
            push(0x72a0_0000 | ((v >> 16) << 5));
            push(RET);
        }
        Behavior::ReturnI64(v) => {
            let v = v as u64;
            // movz x0, #part0 ; movk x0, #partN, lsl #(16 * N)
            push(0xd280_0000 | (((v & 0xffff) as u32) << 5));
            for hw in 1..4u32 {
                let part = ((v >> (16 * hw)) & 0xffff) as u32;
                push(0xf280_0000 | (hw << 21) | (part << 5));
            }
            push(RET);
        }
        Behavior::Trap => push(UDF),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::DataDef;

    fn func(result: Option<ValType>, body: Vec<Instr>) -> FuncDef {
        FuncDef {
            id: None,
            exports: Vec::new(),
            result,
            body,
        }
    }

    #[test]
    fn test_behavior_of_constant_function() {
        let f = func(Some(ValType::I32), vec![Instr::I32Const(7)]);
        assert_eq!(validate_func(&f), Ok(Behavior::ReturnI32(7)));

        let f = func(
            Some(ValType::I64),
            vec![Instr::I32Const(1), Instr::Drop, Instr::I64Const(-2)],
        );
        assert_eq!(validate_func(&f), Ok(Behavior::ReturnI64(-2)));

        let f = func(None, vec![Instr::Nop]);
        assert_eq!(validate_func(&f), Ok(Behavior::Return));
    }

    #[test]
    fn test_unreachable_is_polymorphic() {
        let f = func(Some(ValType::I32), vec![Instr::Unreachable]);
        assert_eq!(validate_func(&f), Ok(Behavior::Trap));

        let f = func(None, vec![Instr::Unreachable, Instr::Drop]);
        assert_eq!(validate_func(&f), Ok(Behavior::Trap));
    }

    #[test]
    fn test_stack_errors() {
        assert!(validate_func(&func(None, vec![Instr::Drop])).is_err());
        assert!(validate_func(&func(None, vec![Instr::I32Const(1)])).is_err());
        assert!(validate_func(&func(Some(ValType::I32), vec![])).is_err());
        assert!(validate_func(&func(Some(ValType::I64), vec![Instr::I32Const(1)])).is_err());
    }

    #[test]
    fn test_x86_64_encodings() {
        let mut bytes = Vec::new();
        emit_x86_64(&mut bytes, Behavior::ReturnI32(42));
        assert_eq!(bytes, [0xb8, 42, 0, 0, 0, 0xc3]);

        bytes.clear();
        emit_x86_64(&mut bytes, Behavior::Trap);
        assert_eq!(bytes, [0x0f, 0x0b]);
    }

    #[test]
    fn test_aarch64_encodings() {
        let mut bytes = Vec::new();
        emit_aarch64(&mut bytes, Behavior::ReturnI32(42));
        // movz w0, #42 ; movk w0, #0, lsl #16 ; ret
        assert_eq!(&bytes[0..4], &0x5280_0540u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0x72a0_0000u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0xd65f_03c0u32.to_le_bytes());

        bytes.clear();
        emit_aarch64(&mut bytes, Behavior::ReturnI64(0x0001_0002_0003_0004));
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[0..4], &(0xd280_0000u32 | (4 << 5)).to_le_bytes());
        assert_eq!(
            &bytes[12..16],
            &(0xf280_0000u32 | (3 << 21) | (1 << 5)).to_le_bytes()
        );
    }

    #[test]
    fn test_layout_aligns_functions_then_data() {
        let module = ModuleAst {
            memory_pages: Some(1),
            data: vec![DataDef {
                offset: 0,
                bytes: vec![0xab],
            }],
            funcs: vec![
                func(None, vec![]),
                func(Some(ValType::I32), vec![Instr::I32Const(1)]),
            ],
            ..ModuleAst::default()
        };
        let mut config = Config::new();
        config.function_alignment(32);

        let image = generate(&module, &config, Target::X86_64).unwrap();
        assert_eq!(image.functions[0].offset, 0);
        assert_eq!(image.functions[1].offset, 32);
        assert_eq!(image.text_len, 32 + 6);
        assert_eq!(image.data[0].image_offset, 48);
        assert_eq!(image.bytes[48], 0xab);
        assert_eq!(image.bytes.len(), 49);
        assert!(image.bytes[1..32].iter().all(|&b| b == 0xcc));
    }

    #[test]
    fn test_module_validation() {
        let no_memory = ModuleAst {
            data: vec![DataDef {
                offset: 0,
                bytes: vec![1],
            }],
            ..ModuleAst::default()
        };
        assert!(matches!(
            generate(&no_memory, &Config::new(), Target::host()),
            Err(CompileError::Validation(_))
        ));

        let overflow = ModuleAst {
            memory_pages: Some(1),
            data: vec![DataDef {
                offset: 65535,
                bytes: vec![1, 2],
            }],
            ..ModuleAst::default()
        };
        assert!(generate(&overflow, &Config::new(), Target::host()).is_err());

        let mut a = func(None, vec![]);
        a.exports.push("f".into());
        let duplicate = ModuleAst {
            funcs: vec![a.clone(), a],
            ..ModuleAst::default()
        };
        assert!(generate(&duplicate, &Config::new(), Target::host()).is_err());
    }

    #[test]
    fn test_image_limit() {
        let module = ModuleAst {
            funcs: vec![func(None, vec![]); 4],
            ..ModuleAst::default()
        };
        let mut config = Config::new();
        config.max_code_size(16);
        assert!(matches!(
            generate(&module, &config, Target::X86_64),
            Err(CompileError::ImageTooLarge { limit: 16, .. })
        ));
    }
}
