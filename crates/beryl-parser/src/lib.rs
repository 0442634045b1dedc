//! Lexer and token stream for the Beryl scripting language.
//!
//! The lexer runs as a single pre-pass producing an addressable token
//! array with line/column metadata; the parser then seeks freely within
//! it. Nothing in this crate knows about classes or code generation.

pub mod lexer;
pub mod token;

pub use lexer::{LexError, Lexer};
pub use token::{Span, Token, TokenStream};
