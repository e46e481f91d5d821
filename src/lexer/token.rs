use serde::{Deserialize, Serialize};

/// A single token from the source code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// The type of token
    pub kind: TokenKind,
    /// Original text of the token
    pub lexeme: String,
    /// Line number where token appears (1-indexed)
    pub line: usize,
    /// Column number where token starts (1-indexed)
    pub column: usize,
}

impl Token {
    /// Creates a new token with the given properties
    pub fn new(kind: TokenKind, lexeme: String, line: usize, column: usize) -> Self {
        Token {
            kind,
            lexeme,
            line,
            column,
        }
    }

    /// Short human-readable description used in parse errors
    pub fn describe(&self) -> String {
        match &self.kind {
            TokenKind::LeftParen => "'('".to_string(),
            TokenKind::RightParen => "')'".to_string(),
            TokenKind::Eof => "end of file".to_string(),
            TokenKind::String(_) => format!("string {}", self.lexeme),
            TokenKind::Integer(n) => format!("integer {}", n),
            TokenKind::Keyword(k) => format!("keyword '{}'", k),
            TokenKind::Id(id) => format!("identifier '${}'", id),
        }
    }
}

/// All possible token types in module source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenKind {
    // Delimiters
    /// Left parenthesis (
    LeftParen,
    /// Right parenthesis )
    RightParen,

    // Literals
    /// Integer literal (decimal or 0x-prefixed hex, optionally signed)
    Integer(i64),
    /// String literal, already unescaped to raw bytes
    String(Vec<u8>),

    // Names
    /// Bare word such as `module`, `func` or `i32.const`
    Keyword(String),
    /// Symbolic name prefixed with `$`, stored without the prefix
    Id(String),

    /// End of file marker
    Eof,
}
