//! Recursive-descent parser from tokens to [`ModuleAst`](super::ast::ModuleAst)

use super::ast::{DataDef, FuncDef, Instr, ModuleAst, ValType};
use crate::error::CompileError;
use crate::lexer::{Token, TokenKind};

type Result<T> = std::result::Result<T, CompileError>;

/// Deepest folded-instruction nesting accepted
pub const MAX_NESTING_DEPTH: usize = 1024;

/// Recursive-descent parser for `(module ...)` source
pub struct ModuleParser {
    tokens: Vec<Token>,
    current: usize,
    depth: usize,
}

impl ModuleParser {
    /// Creates a new module parser
    pub fn new(tokens: Vec<Token>) -> Self {
        ModuleParser {
            tokens,
            current: 0,
            depth: 0,
        }
    }

    /// Parses exactly one module form followed by end of input
    pub fn parse(&mut self) -> Result<ModuleAst> {
        self.consume_paren()?;
        self.expect_keyword("module")?;

        let mut module = ModuleAst {
            id: self.optional_id(),
            ..ModuleAst::default()
        };

        while !self.check(&TokenKind::RightParen) {
            self.consume_paren()?;
            let field = self.expect_any_keyword()?;
            match field.as_str() {
                "memory" => self.parse_memory(&mut module)?,
                "data" => module.data.push(self.parse_data()?),
                "func" => module.funcs.push(self.parse_func()?),
                other => {
                    return Err(self.unexpected(format!("module field, found '{}'", other)));
                }
            }
        }
        self.consume_close()?;

        if !self.is_at_end() {
            return Err(self.unexpected("end of file after module"));
        }
        Ok(module)
    }

    /// `(memory $id? (export "name")* min max?)`, opening paren and keyword already consumed
    fn parse_memory(&mut self, module: &mut ModuleAst) -> Result<()> {
        if module.memory_pages.is_some() {
            return Err(CompileError::Validation(
                "multiple memories are not supported".to_string(),
            ));
        }
        self.optional_id();
        while self.check(&TokenKind::LeftParen)
            && self.peek_keyword_after_paren().as_deref() == Some("export")
        {
            self.advance();
            self.advance();
            module.memory_exports.push(self.expect_name()?);
            self.consume_close()?;
        }
        let min = self.expect_u32("memory size")?;
        if let TokenKind::Integer(_) = self.peek().kind {
            let max = self.expect_u32("memory maximum")?;
            if max < min {
                return Err(CompileError::Validation(format!(
                    "memory maximum {} is below its minimum {}",
                    max, min
                )));
            }
        }
        self.consume_close()?;
        module.memory_pages = Some(min);
        Ok(())
    }

    /// `(data $id? (i32.const N)? "bytes"*)`
    fn parse_data(&mut self) -> Result<DataDef> {
        self.optional_id();

        let mut offset = 0;
        if self.check(&TokenKind::LeftParen) {
            self.advance();
            let keyword = self.expect_any_keyword()?;
            if keyword == "offset" {
                self.consume_paren()?;
                self.expect_keyword("i32.const")?;
                offset = self.expect_u32("data offset")?;
                self.consume_close()?;
            } else if keyword == "i32.const" {
                offset = self.expect_u32("data offset")?;
            } else {
                return Err(self.unexpected(format!("data offset, found '{}'", keyword)));
            }
            self.consume_close()?;
        }

        let mut bytes = Vec::new();
        while let TokenKind::String(s) = &self.peek().kind {
            bytes.extend_from_slice(s);
            self.advance();
        }
        self.consume_close()?;

        Ok(DataDef { offset, bytes })
    }

    /// `(func $id? (export "name")* (result t)? instr*)`
    fn parse_func(&mut self) -> Result<FuncDef> {
        let mut func = FuncDef {
            id: self.optional_id(),
            ..FuncDef::default()
        };

        // Header clauses come before the body
        loop {
            if !self.check(&TokenKind::LeftParen) {
                break;
            }
            let clause = match self.peek_keyword_after_paren() {
                Some(clause) if clause == "export" || clause == "result" => clause,
                _ => break,
            };
            self.advance();
            self.advance();
            if clause == "export" {
                func.exports.push(self.expect_name()?);
            } else {
                if func.result.is_some() {
                    return Err(CompileError::Validation(
                        "multiple results are not supported".to_string(),
                    ));
                }
                let keyword = self.expect_any_keyword()?;
                func.result = Some(ValType::from_keyword(&keyword).ok_or_else(|| {
                    CompileError::Validation(format!("unsupported result type '{}'", keyword))
                })?);
            }
            self.consume_close()?;
        }

        while !self.check(&TokenKind::RightParen) {
            self.parse_instr(&mut func.body)?;
        }
        self.consume_close()?;

        Ok(func)
    }

    /// One plain or folded instruction, appended to `body` in execution order
    fn parse_instr(&mut self, body: &mut Vec<Instr>) -> Result<()> {
        if self.check(&TokenKind::LeftParen) {
            if self.depth >= MAX_NESTING_DEPTH {
                return Err(nesting_too_deep());
            }
            self.advance();
            let instr = self.parse_plain_instr()?;
            self.depth += 1;
            while !self.check(&TokenKind::RightParen) {
                self.parse_instr(body)?;
            }
            self.depth -= 1;
            self.consume_close()?;
            body.push(instr);
        } else {
            let instr = self.parse_plain_instr()?;
            body.push(instr);
        }
        Ok(())
    }

    fn parse_plain_instr(&mut self) -> Result<Instr> {
        let keyword = self.expect_any_keyword()?;
        let instr = match keyword.as_str() {
            "i32.const" => {
                let value = self.expect_integer("i32.const operand")?;
                // Both signed and unsigned spellings are accepted, as in WAT
                let value = i32::try_from(value)
                    .or_else(|_| u32::try_from(value).map(|v| v as i32))
                    .map_err(|_| {
                        CompileError::Validation(format!("i32 constant out of range: {}", value))
                    })?;
                Instr::I32Const(value)
            }
            "i64.const" => Instr::I64Const(self.expect_integer("i64.const operand")?),
            "drop" => Instr::Drop,
            "nop" => Instr::Nop,
            "unreachable" => Instr::Unreachable,
            other => {
                return Err(self.unexpected(format!("instruction, found '{}'", other)));
            }
        };
        Ok(instr)
    }

    // Token helpers

    fn is_at_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    fn advance(&mut self) -> Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.tokens[self.current - 1].clone()
    }

    fn check(&self, kind: &TokenKind) -> bool {
        if self.is_at_end() {
            return false;
        }
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn peek_keyword_after_paren(&self) -> Option<String> {
        match self.tokens.get(self.current + 1).map(|t| &t.kind) {
            Some(TokenKind::Keyword(k)) => Some(k.clone()),
            _ => None,
        }
    }

    fn consume_paren(&mut self) -> Result<()> {
        self.consume(TokenKind::LeftParen, "'('")
    }

    fn consume_close(&mut self) -> Result<()> {
        self.consume(TokenKind::RightParen, "')'")
    }

    fn consume(&mut self, kind: TokenKind, expected: &str) -> Result<()> {
        if self.check(&kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn optional_id(&mut self) -> Option<String> {
        if let TokenKind::Id(id) = &self.peek().kind {
            let id = id.clone();
            self.advance();
            Some(id)
        } else {
            None
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        match &self.peek().kind {
            TokenKind::Keyword(k) if k == keyword => {
                self.advance();
                Ok(())
            }
            _ => Err(self.unexpected(format!("'{}'", keyword))),
        }
    }

    fn expect_any_keyword(&mut self) -> Result<String> {
        match &self.peek().kind {
            TokenKind::Keyword(k) => {
                let k = k.clone();
                self.advance();
                Ok(k)
            }
            _ => Err(self.unexpected("keyword")),
        }
    }

    fn expect_name(&mut self) -> Result<String> {
        match &self.peek().kind {
            TokenKind::String(bytes) => {
                let name = String::from_utf8(bytes.clone()).map_err(|_| {
                    CompileError::Validation("export name is not valid UTF-8".to_string())
                })?;
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("export name string")),
        }
    }

    fn expect_integer(&mut self, what: &str) -> Result<i64> {
        match self.peek().kind {
            TokenKind::Integer(n) => {
                self.advance();
                Ok(n)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn expect_u32(&mut self, what: &str) -> Result<u32> {
        let value = self.expect_integer(what)?;
        u32::try_from(value)
            .map_err(|_| CompileError::Validation(format!("{} out of range: {}", what, value)))
    }

    fn unexpected(&self, expected: impl Into<String>) -> CompileError {
        let token = self.peek();
        if self.is_at_end() {
            return CompileError::UnexpectedEof;
        }
        CompileError::UnexpectedToken {
            expected: expected.into(),
            got: token.describe(),
            line: token.line,
        }
    }
}

#[cold]
fn nesting_too_deep() -> CompileError {
    CompileError::Validation(format!(
        "nesting too deep (limit {})",
        MAX_NESTING_DEPTH
    ))
}
