//! Lexer for the Beryl scripting language.
//!
//! A logos scanner recognizes the raw vocabulary; a conversion pass turns
//! the raw matches into the final token array, computing line/column
//! metadata, concatenating adjacent string literals and applying the
//! `default-float` option.
//!
//! Integer literals come in bases 2 (`0b`), 4 (`0q`), 8 (`0o`), 10 and
//! 16 (`0x`). Strings come in an escaped flavor (`"…"`) and a verbatim
//! flavor (`@"…"`, with `""` escaping a quote); both concatenate when
//! adjacent. Tabs advance the column to the next multiple of 4; CR, LF
//! and CRLF each count as one newline.

use crate::token::{Span, Token};
use logos::{FilterResult, Logos};
use thiserror::Error;

/// What went wrong, without location. Locations are attached by the
/// conversion pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Error)]
pub enum LexErrorKind {
    /// No rule matched.
    #[default]
    #[error("unexpected character")]
    UnexpectedCharacter,
    /// String literal ran to end of line or file.
    #[error("unterminated string literal")]
    UnterminatedString,
    /// `/*` without a matching `*/`.
    #[error("unterminated block comment")]
    UnterminatedComment,
    /// Numeric literal does not fit the integer range.
    #[error("numeric literal out of range")]
    NumberOutOfRange,
    /// Unknown escape sequence in a string or character literal.
    #[error("invalid escape sequence")]
    InvalidEscape,
    /// `\x`/`\0` escape value exceeds the character range.
    #[error("character value too large")]
    CharacterValueTooLarge,
    /// Malformed character literal.
    #[error("invalid character literal")]
    InvalidCharLiteral,
}

/// A lexer error with its source position.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at {line}:{column}")]
pub struct LexError {
    /// Error classification.
    pub kind: LexErrorKind,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

/// Raw logos vocabulary. Converted into [`Token`] by the conversion pass.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(error = LexErrorKind)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"#[^\n]*")]
enum RawToken {
    #[regex(r"/\*", lex_block_comment)]
    BlockComment,

    // Keywords
    #[token("accessor")]
    Accessor,
    #[token("alias")]
    Alias,
    #[token("and")]
    And,
    #[token("array")]
    Array,
    #[token("break")]
    Break,
    #[token("case")]
    Case,
    #[token("class")]
    Class,
    #[token("clause")]
    Clause,
    #[token("cofunction")]
    Cofunction,
    #[token("const")]
    Const,
    #[token("continue")]
    Continue,
    #[token("convertor")]
    Convertor,
    #[token("default")]
    Default,
    #[token("delegate")]
    Delegate,
    #[token("do")]
    Do,
    #[token("else")]
    Else,
    #[token("explicit")]
    Explicit,
    #[token("extends")]
    Extends,
    #[token("extern")]
    Extern,
    #[token("false")]
    False,
    #[token("for")]
    For,
    #[token("function")]
    Function,
    #[token("goto")]
    Goto,
    #[token("hybrid")]
    Hybrid,
    #[token("if")]
    If,
    #[token("implements")]
    Implements,
    #[token("import")]
    Import,
    #[token("inherits")]
    Inherits,
    #[token("interface")]
    Interface,
    #[token("method")]
    Method,
    #[token("namespace")]
    Namespace,
    #[token("native")]
    Native,
    #[token("new")]
    New,
    #[token("not")]
    Not,
    #[token("null")]
    Null,
    #[token("option")]
    Option,
    #[token("or")]
    Or,
    #[token("private")]
    Private,
    #[token("return")]
    Return,
    #[token("sameref")]
    SameRef,
    #[token("strict")]
    Strict,
    #[token("switch")]
    Switch,
    #[token("this")]
    This,
    #[token("throw")]
    Throw,
    #[token("true")]
    True,
    #[token("typeof")]
    TypeOf,
    #[token("using")]
    Using,
    #[token("var")]
    Var,
    #[token("virtual")]
    Virtual,
    #[token("weak")]
    Weak,
    #[token("while")]
    While,
    #[token("yield")]
    Yield,
    #[token("__brk")]
    BrkKw,
    #[token("__rtchk")]
    RtChkKw,
    #[token("__selftest")]
    SelfTest,

    // Identifiers (after keywords)
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Integer literals, bases 2/4/8/16
    #[regex(r"0[xX][0-9a-fA-F]+", |lex| parse_radix(lex.slice(), 16))]
    #[regex(r"0[bB][01]+", |lex| parse_radix(lex.slice(), 2))]
    #[regex(r"0[qQ][0-3]+", |lex| parse_radix(lex.slice(), 4))]
    #[regex(r"0[oO][0-7]+", |lex| parse_radix(lex.slice(), 8))]
    IntRadix(i64),

    // Bare decimal integer; becomes a float under `default-float`.
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().map_err(|_| LexErrorKind::NumberOutOfRange))]
    IntDec(i64),

    // Float literals, triggered by '.' or an exponent
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", parse_float)]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", parse_float)]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", parse_float)]
    FloatLit(f64),

    // Escaped string literal
    #[regex(r#""([^"\\\r\n]|\\[^\r\n])*""#, parse_escaped_string)]
    StrLit(String),

    // Verbatim string literal: @"…" with "" escaping a quote
    #[regex(r#"@""#, lex_verbatim_string)]
    VerbatimLit(String),

    // Character literal, yields an int
    #[regex(r"'([^'\\\r\n]|\\[^\r\n])+'", parse_char_literal)]
    CharLit(i64),

    // Operators, longest match first
    #[token("<<=")]
    ShlAssign,
    #[token(">>=")]
    ShrAssign,
    #[token("==")]
    Eq,
    #[token("!=")]
    Ne,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("+=")]
    PlusAssign,
    #[token("-=")]
    MinusAssign,
    #[token("*=")]
    StarAssign,
    #[token("/=")]
    SlashAssign,
    #[token("%=")]
    PercentAssign,
    #[token("&=")]
    AmpAssign,
    #[token("|=")]
    PipeAssign,
    #[token("^=")]
    CaretAssign,
    #[token("++")]
    PlusPlus,
    #[token("--")]
    MinusMinus,
    #[token("::")]
    ColonColon,
    #[token("=>")]
    Arrow,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("=")]
    Assign,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("!")]
    Bang,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,
    #[token(".")]
    Dot,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,
    #[token(":")]
    Colon,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("?")]
    Question,
}

fn parse_radix(slice: &str, radix: u32) -> Result<i64, LexErrorKind> {
    i64::from_str_radix(&slice[2..], radix).map_err(|_| LexErrorKind::NumberOutOfRange)
}

fn parse_float(lex: &mut logos::Lexer<RawToken>) -> Result<f64, LexErrorKind> {
    lex.slice()
        .parse()
        .map_err(|_| LexErrorKind::NumberOutOfRange)
}

fn lex_block_comment(lex: &mut logos::Lexer<RawToken>) -> FilterResult<(), LexErrorKind> {
    let remainder = lex.remainder();
    match remainder.find("*/") {
        Some(end) => {
            lex.bump(end + 2);
            FilterResult::Skip
        }
        None => {
            lex.bump(remainder.len());
            FilterResult::Error(LexErrorKind::UnterminatedComment)
        }
    }
}

fn lex_verbatim_string(lex: &mut logos::Lexer<RawToken>) -> Result<String, LexErrorKind> {
    // The slice so far is `@"`; scan the remainder ourselves.
    let remainder = lex.remainder();
    let mut out = String::new();
    let mut chars = remainder.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '"' {
            if let Some(&(_, '"')) = chars.peek() {
                chars.next();
                out.push('"');
                continue;
            }
            lex.bump(i + 1);
            return Ok(out);
        }
        out.push(c);
    }
    lex.bump(remainder.len());
    Err(LexErrorKind::UnterminatedString)
}

fn parse_escaped_string(lex: &mut logos::Lexer<RawToken>) -> Result<String, LexErrorKind> {
    let slice = lex.slice();
    unescape(&slice[1..slice.len() - 1])
}

fn parse_char_literal(lex: &mut logos::Lexer<RawToken>) -> Result<i64, LexErrorKind> {
    let slice = lex.slice();
    let inner = unescape(&slice[1..slice.len() - 1]).map_err(|e| match e {
        LexErrorKind::CharacterValueTooLarge => e,
        _ => LexErrorKind::InvalidCharLiteral,
    })?;
    let mut chars = inner.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c as i64),
        _ => Err(LexErrorKind::InvalidCharLiteral),
    }
}

/// Evaluate the escape sequences of an escaped string body.
///
/// Supported: `a b e f n r t v ' " \`, `\xHH…` hex and `\0OOO…` octal.
/// A hex or octal value above the single-byte character range fails with
/// `CharacterValueTooLarge`.
fn unescape(s: &str) -> Result<String, LexErrorKind> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('a') => out.push('\x07'),
            Some('b') => out.push('\x08'),
            Some('e') => out.push('\x1b'),
            Some('f') => out.push('\x0c'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('v') => out.push('\x0b'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('x') => {
                let mut value: u32 = 0;
                let mut digits = 0;
                while let Some(d) = chars.peek().and_then(|c| c.to_digit(16)) {
                    chars.next();
                    digits += 1;
                    value = value.saturating_mul(16).saturating_add(d);
                    if value > 0xFF {
                        return Err(LexErrorKind::CharacterValueTooLarge);
                    }
                }
                if digits == 0 {
                    return Err(LexErrorKind::InvalidEscape);
                }
                out.push(value as u8 as char);
            }
            Some('0') => {
                let mut value: u32 = 0;
                while let Some(d) = chars.peek().and_then(|c| c.to_digit(8)) {
                    chars.next();
                    value = value.saturating_mul(8).saturating_add(d);
                    if value > 0xFF {
                        return Err(LexErrorKind::CharacterValueTooLarge);
                    }
                }
                out.push(value as u8 as char);
            }
            _ => return Err(LexErrorKind::InvalidEscape),
        }
    }
    Ok(out)
}

/// Main lexer.
pub struct Lexer<'a> {
    source: &'a str,
    default_float: bool,
}

impl<'a> Lexer<'a> {
    /// Lexer over a source buffer.
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            default_float: false,
        }
    }

    /// Treat bare decimal integer literals as floats (`default-float`).
    pub fn default_float(mut self, enable: bool) -> Self {
        self.default_float = enable;
        self
    }

    /// Run the scanner, producing the finite token array or the list of
    /// lexer errors.
    pub fn tokenize(self) -> Result<Vec<(Token, Span)>, Vec<LexError>> {
        let mut tokens: Vec<(Token, Span)> = Vec::new();
        let mut errors: Vec<LexError> = Vec::new();
        let mut lexer = RawToken::lexer(self.source);
        let mut line = 1u32;
        let mut column = 1u32;
        let mut prev_cr = false;
        let mut last_end = 0usize;

        while let Some(result) = lexer.next() {
            let range = lexer.span();

            // Advance position over everything since the previous token.
            for c in self.source[last_end..range.start].chars() {
                advance_position(c, &mut line, &mut column, &mut prev_cr);
            }
            let span = Span::new(range.start, range.end, line, column);

            match result {
                Ok(raw) => {
                    // Adjacent string literals concatenate, mixing the
                    // escaped and verbatim flavors freely.
                    if let RawToken::StrLit(s) | RawToken::VerbatimLit(s) = &raw {
                        if let Some((Token::StrLit(prev), _)) = tokens.last_mut() {
                            prev.push_str(s);
                        } else {
                            tokens.push((Token::StrLit(s.clone()), span));
                        }
                    } else {
                        tokens.push((self.convert(raw), span));
                    }
                }
                Err(kind) => errors.push(LexError {
                    kind,
                    line,
                    column,
                }),
            }

            for c in self.source[range.start..range.end].chars() {
                advance_position(c, &mut line, &mut column, &mut prev_cr);
            }
            last_end = range.end;
        }

        for c in self.source[last_end..].chars() {
            advance_position(c, &mut line, &mut column, &mut prev_cr);
        }
        tokens.push((
            Token::Eof,
            Span::new(self.source.len(), self.source.len(), line, column),
        ));

        if errors.is_empty() {
            Ok(tokens)
        } else {
            Err(errors)
        }
    }

    fn convert(&self, raw: RawToken) -> Token {
        match raw {
            RawToken::Accessor => Token::Accessor,
            RawToken::Alias => Token::Alias,
            RawToken::And => Token::And,
            RawToken::Array => Token::Array,
            RawToken::Break => Token::Break,
            RawToken::Case => Token::Case,
            RawToken::Class => Token::Class,
            RawToken::Clause => Token::Clause,
            RawToken::Cofunction => Token::Cofunction,
            RawToken::Const => Token::Const,
            RawToken::Continue => Token::Continue,
            RawToken::Convertor => Token::Convertor,
            RawToken::Default => Token::Default,
            RawToken::Delegate => Token::Delegate,
            RawToken::Do => Token::Do,
            RawToken::Else => Token::Else,
            RawToken::Explicit => Token::Explicit,
            RawToken::Extends => Token::Extends,
            RawToken::Extern => Token::Extern,
            RawToken::False => Token::False,
            RawToken::For => Token::For,
            RawToken::Function => Token::Function,
            RawToken::Goto => Token::Goto,
            RawToken::Hybrid => Token::Hybrid,
            RawToken::If => Token::If,
            RawToken::Implements => Token::Implements,
            RawToken::Import => Token::Import,
            RawToken::Inherits => Token::Inherits,
            RawToken::Interface => Token::Interface,
            RawToken::Method => Token::Method,
            RawToken::Namespace => Token::Namespace,
            RawToken::Native => Token::Native,
            RawToken::New => Token::New,
            RawToken::Not => Token::Not,
            RawToken::Null => Token::Null,
            RawToken::Option => Token::Option,
            RawToken::Or => Token::Or,
            RawToken::Private => Token::Private,
            RawToken::Return => Token::Return,
            RawToken::SameRef => Token::SameRef,
            RawToken::Strict => Token::Strict,
            RawToken::Switch => Token::Switch,
            RawToken::This => Token::This,
            RawToken::Throw => Token::Throw,
            RawToken::True => Token::True,
            RawToken::TypeOf => Token::TypeOf,
            RawToken::Using => Token::Using,
            RawToken::Var => Token::Var,
            RawToken::Virtual => Token::Virtual,
            RawToken::Weak => Token::Weak,
            RawToken::While => Token::While,
            RawToken::Yield => Token::Yield,
            RawToken::BrkKw => Token::BrkKw,
            RawToken::RtChkKw => Token::RtChkKw,
            RawToken::SelfTest => Token::SelfTest,
            RawToken::Ident(s) => Token::Ident(s),
            RawToken::IntRadix(v) => Token::IntLit(v),
            RawToken::IntDec(v) => {
                if self.default_float {
                    Token::FloatLit(v as f64)
                } else {
                    Token::IntLit(v)
                }
            }
            RawToken::FloatLit(v) => Token::FloatLit(v),
            RawToken::CharLit(v) => Token::IntLit(v),
            RawToken::ShlAssign => Token::ShlAssign,
            RawToken::ShrAssign => Token::ShrAssign,
            RawToken::Eq => Token::Eq,
            RawToken::Ne => Token::Ne,
            RawToken::Le => Token::Le,
            RawToken::Ge => Token::Ge,
            RawToken::AndAnd => Token::AndAnd,
            RawToken::OrOr => Token::OrOr,
            RawToken::Shl => Token::Shl,
            RawToken::Shr => Token::Shr,
            RawToken::PlusAssign => Token::PlusAssign,
            RawToken::MinusAssign => Token::MinusAssign,
            RawToken::StarAssign => Token::StarAssign,
            RawToken::SlashAssign => Token::SlashAssign,
            RawToken::PercentAssign => Token::PercentAssign,
            RawToken::AmpAssign => Token::AmpAssign,
            RawToken::PipeAssign => Token::PipeAssign,
            RawToken::CaretAssign => Token::CaretAssign,
            RawToken::PlusPlus => Token::PlusPlus,
            RawToken::MinusMinus => Token::MinusMinus,
            RawToken::ColonColon => Token::ColonColon,
            RawToken::Arrow => Token::Arrow,
            RawToken::Plus => Token::Plus,
            RawToken::Minus => Token::Minus,
            RawToken::Star => Token::Star,
            RawToken::Slash => Token::Slash,
            RawToken::Percent => Token::Percent,
            RawToken::Assign => Token::Assign,
            RawToken::Lt => Token::Lt,
            RawToken::Gt => Token::Gt,
            RawToken::Bang => Token::Bang,
            RawToken::Amp => Token::Amp,
            RawToken::Pipe => Token::Pipe,
            RawToken::Caret => Token::Caret,
            RawToken::Tilde => Token::Tilde,
            RawToken::Dot => Token::Dot,
            RawToken::Comma => Token::Comma,
            RawToken::Semicolon => Token::Semicolon,
            RawToken::Colon => Token::Colon,
            RawToken::LParen => Token::LParen,
            RawToken::RParen => Token::RParen,
            RawToken::LBrace => Token::LBrace,
            RawToken::RBrace => Token::RBrace,
            RawToken::LBracket => Token::LBracket,
            RawToken::RBracket => Token::RBracket,
            RawToken::Question => Token::Question,
            RawToken::StrLit(_) | RawToken::VerbatimLit(_) => {
                unreachable!("string literals handled by the concatenation path")
            }
            RawToken::BlockComment => unreachable!("block comments are skipped"),
        }
    }
}

/// Advance line/column over one character. CR, LF and CRLF each count as
/// one newline; tabs snap the column to the next multiple of 4.
fn advance_position(c: char, line: &mut u32, column: &mut u32, prev_cr: &mut bool) {
    match c {
        '\r' => {
            *line += 1;
            *column = 1;
            *prev_cr = true;
            return;
        }
        '\n' => {
            if !*prev_cr {
                *line += 1;
                *column = 1;
            }
        }
        '\t' => {
            *column = (*column / 4 + 1) * 4;
        }
        _ => {
            *column += 1;
        }
    }
    *prev_cr = false;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<Token> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|(t, _)| t)
            .collect()
    }

    fn lex_err(src: &str) -> Vec<LexError> {
        Lexer::new(src).tokenize().unwrap_err()
    }

    #[test]
    fn test_keywords_and_idents() {
        let tokens = lex("class Foo cofunction bar __rtchk");
        assert_eq!(
            tokens,
            vec![
                Token::Class,
                Token::Ident("Foo".into()),
                Token::Cofunction,
                Token::Ident("bar".into()),
                Token::RtChkKw,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_integer_bases() {
        let tokens = lex("10 0x1F 0b101 0q123 0o17");
        assert_eq!(
            tokens,
            vec![
                Token::IntLit(10),
                Token::IntLit(31),
                Token::IntLit(5),
                Token::IntLit(27),
                Token::IntLit(15),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_float_literals() {
        let tokens = lex("1.5 2e3 .25");
        assert_eq!(
            tokens,
            vec![
                Token::FloatLit(1.5),
                Token::FloatLit(2000.0),
                Token::FloatLit(0.25),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_default_float_option() {
        let tokens: Vec<Token> = Lexer::new("3 0x10")
            .default_float(true)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|(t, _)| t)
            .collect();
        // Only bare decimal literals are promoted.
        assert_eq!(
            tokens,
            vec![Token::FloatLit(3.0), Token::IntLit(16), Token::Eof]
        );
    }

    #[test]
    fn test_escaped_string() {
        let tokens = lex(r#""a\tb\x41\0101""#);
        assert_eq!(tokens[0], Token::StrLit("a\tbAA".into()));
    }

    #[test]
    fn test_verbatim_string() {
        let tokens = lex(r#"@"no \escape ""quoted""""#);
        assert_eq!(tokens[0], Token::StrLit("no \\escape \"quoted\"".into()));
    }

    #[test]
    fn test_adjacent_strings_concatenate() {
        let tokens = lex("\"one \" /* gap */ @\"two\" // tail\n\" three\"");
        assert_eq!(tokens[0], Token::StrLit("one two three".into()));
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn test_char_literal_is_int() {
        let tokens = lex(r"'A' '\n'");
        assert_eq!(tokens[0], Token::IntLit(65));
        assert_eq!(tokens[1], Token::IntLit(10));
    }

    #[test]
    fn test_character_value_too_large() {
        let errors = lex_err(r#""\x1FF""#);
        assert_eq!(errors[0].kind, LexErrorKind::CharacterValueTooLarge);
    }

    #[test]
    fn test_unterminated_block_comment() {
        let errors = lex_err("1 /* never closed");
        assert_eq!(errors[0].kind, LexErrorKind::UnterminatedComment);
    }

    #[test]
    fn test_hash_comment() {
        let tokens = lex("1 # comment\n2");
        assert_eq!(tokens, vec![Token::IntLit(1), Token::IntLit(2), Token::Eof]);
    }

    #[test]
    fn test_operators_longest_match() {
        let tokens = lex(">>= >> > :: : => = ==");
        assert_eq!(
            tokens,
            vec![
                Token::ShrAssign,
                Token::Shr,
                Token::Gt,
                Token::ColonColon,
                Token::Colon,
                Token::Arrow,
                Token::Assign,
                Token::Eq,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_line_column_tracking() {
        let spans: Vec<(Token, Span)> = Lexer::new("a\r\nb\rc\n\td").tokenize().unwrap();
        // a @ 1:1, b @ 2:1 (CRLF once), c @ 3:1 (CR once), d @ 4 after tab
        assert_eq!((spans[0].1.line, spans[0].1.column), (1, 1));
        assert_eq!((spans[1].1.line, spans[1].1.column), (2, 1));
        assert_eq!((spans[2].1.line, spans[2].1.column), (3, 1));
        assert_eq!((spans[3].1.line, spans[3].1.column), (4, 4));
    }

    #[test]
    fn test_unexpected_character() {
        let errors = lex_err("a $ b");
        assert_eq!(errors[0].kind, LexErrorKind::UnexpectedCharacter);
        assert_eq!(errors[0].column, 3);
    }
}
