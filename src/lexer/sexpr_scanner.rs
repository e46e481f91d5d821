use super::token::{Token, TokenKind};
use crate::error::CompileError;

type Result<T> = std::result::Result<T, CompileError>;

/// Scanner for S-expression module source
pub struct SExprScanner {
    /// Source code as character vector
    source: Vec<char>,
    /// Accumulated tokens
    tokens: Vec<Token>,
    /// Start position of current token
    start: usize,
    /// Current position in source
    current: usize,
    /// Current line number (1-indexed)
    line: usize,
    /// Current column number (1-indexed)
    column: usize,
}

impl SExprScanner {
    /// Creates a new S-expression scanner from source code
    pub fn new(source: &str) -> Self {
        SExprScanner {
            source: source.chars().collect(),
            tokens: Vec::new(),
            start: 0,
            current: 0,
            line: 1,
            column: 1,
        }
    }

    /// Scans all tokens from source code and returns them as a vector
    pub fn scan_tokens(&mut self) -> Result<Vec<Token>> {
        while !self.is_at_end() {
            self.start = self.current;
            self.scan_token()?;
        }

        self.tokens.push(Token::new(
            TokenKind::Eof,
            String::new(),
            self.line,
            self.column,
        ));

        Ok(std::mem::take(&mut self.tokens))
    }

    fn scan_token(&mut self) -> Result<()> {
        let c = self.advance();

        match c {
            ' ' | '\r' | '\t' | '\n' => {
                if c == '\n' {
                    self.line += 1;
                    self.column = 1;
                }
            }

            // Line comments start with ;;
            ';' => {
                if !self.match_char(';') {
                    return Err(self.error("Expected ';;' to start a comment"));
                }
                self.skip_line_comment();
            }

            // Block comments (; ... ;) nest
            '(' if self.peek() == ';' => {
                self.advance();
                self.skip_block_comment()?;
            }

            '(' => self.add_token(TokenKind::LeftParen),
            ')' => self.add_token(TokenKind::RightParen),

            '"' => self.scan_string()?,

            '$' => self.scan_id()?,

            c if c.is_ascii_digit() => self.scan_number()?,
            '-' | '+' if self.peek().is_ascii_digit() => self.scan_number()?,

            c if c.is_ascii_alphabetic() => self.scan_keyword(),

            _ => {
                return Err(self.error(format!("Unexpected character '{}'", c)));
            }
        }

        Ok(())
    }

    fn skip_line_comment(&mut self) {
        while !self.is_at_end() && self.peek() != '\n' {
            self.advance();
        }
    }

    fn skip_block_comment(&mut self) -> Result<()> {
        let mut depth = 1;
        while depth > 0 {
            if self.is_at_end() {
                return Err(self.error("Unterminated block comment"));
            }
            match self.advance() {
                '\n' => {
                    self.line += 1;
                    self.column = 1;
                }
                '(' if self.match_char(';') => depth += 1,
                ';' if self.match_char(')') => depth -= 1,
                _ => {}
            }
        }
        Ok(())
    }

    fn scan_string(&mut self) -> Result<()> {
        let mut value = Vec::new();

        while !self.is_at_end() && self.peek() != '"' {
            let c = self.advance();
            match c {
                '\\' => {
                    let escaped = self.advance_or_eof()?;
                    match escaped {
                        'n' => value.push(b'\n'),
                        't' => value.push(b'\t'),
                        'r' => value.push(b'\r'),
                        '\\' => value.push(b'\\'),
                        '"' => value.push(b'"'),
                        '\'' => value.push(b'\''),
                        hi if hi.is_ascii_hexdigit() => {
                            let lo = self.advance_or_eof()?;
                            match (hi.to_digit(16), lo.to_digit(16)) {
                                (Some(hi), Some(lo)) => value.push((hi * 16 + lo) as u8),
                                _ => {
                                    return Err(self.error(format!(
                                        "Invalid hex escape \\{}{}",
                                        hi, lo
                                    )))
                                }
                            }
                        }
                        _ => {
                            return Err(
                                self.error(format!("Invalid escape sequence \\{}", escaped))
                            );
                        }
                    }
                }
                '\n' => {
                    return Err(self.error("Newline in string literal"));
                }
                c => {
                    let mut buf = [0u8; 4];
                    value.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }

        if self.is_at_end() {
            return Err(self.error("Unterminated string"));
        }

        self.advance(); // Closing "

        self.add_token(TokenKind::String(value));
        Ok(())
    }

    fn scan_number(&mut self) -> Result<()> {
        while self.peek().is_ascii_alphanumeric() || self.peek() == '_' {
            self.advance();
        }

        let text: String = self.source[self.start..self.current]
            .iter()
            .filter(|&&c| c != '_')
            .collect();
        let (negative, digits) = match text.as_bytes().first() {
            Some(b'-') => (true, &text[1..]),
            Some(b'+') => (false, &text[1..]),
            _ => (false, text.as_str()),
        };

        let magnitude = match digits.strip_prefix("0x") {
            Some(hex) => i128::from_str_radix(hex, 16),
            None => digits.parse::<i128>(),
        }
        .map_err(|_| self.error(format!("Invalid integer: {}", text)))?;

        let value = if negative { -magnitude } else { magnitude };
        let value = i64::try_from(value)
            .map_err(|_| self.error(format!("Integer out of range: {}", text)))?;

        self.add_token(TokenKind::Integer(value));
        Ok(())
    }

    fn scan_id(&mut self) -> Result<()> {
        while is_name_char(self.peek()) {
            self.advance();
        }

        let name: String = self.source[self.start + 1..self.current].iter().collect();
        if name.is_empty() {
            return Err(self.error("Expected a name after '$'"));
        }

        self.add_token(TokenKind::Id(name));
        Ok(())
    }

    fn scan_keyword(&mut self) {
        while is_name_char(self.peek()) {
            self.advance();
        }

        let text: String = self.source[self.start..self.current].iter().collect();
        self.add_token(TokenKind::Keyword(text));
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::Syntax {
            line: self.line,
            col: self.column,
            message: message.into(),
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> char {
        let c = self.source[self.current];
        self.current += 1;
        self.column += 1;
        c
    }

    fn advance_or_eof(&mut self) -> Result<char> {
        if self.is_at_end() {
            return Err(self.error("Unterminated string"));
        }
        Ok(self.advance())
    }

    fn peek(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.source[self.current]
        }
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.source[self.current] != expected {
            false
        } else {
            self.current += 1;
            self.column += 1;
            true
        }
    }

    fn add_token(&mut self, kind: TokenKind) {
        let lexeme: String = self.source[self.start..self.current].iter().collect();
        let column = self.column - (self.current - self.start);
        self.tokens.push(Token::new(kind, lexeme, self.line, column));
    }
}

/// Characters allowed after the first one in keywords and `$` names
fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '!' | '?' | '/' | ':' | '<' | '>' | '=')
}
