//! Lexical analysis for module source text
//!
//! Converts source text into a stream of tokens using S-expression syntax.

mod sexpr_scanner;
mod token;

pub use sexpr_scanner::SExprScanner;
pub use token::{Token, TokenKind};
