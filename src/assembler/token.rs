//! Tokens of the assembly language.

use logos::Logos;
use std::ops::Range;

/// A lexical token. Whitespace and `;` comments are skipped.
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    #[error]
    #[regex(r"[ \t\r]+", logos::skip)]
    #[regex(r";[^\n]*", logos::skip)]
    Error,

    /// Statement separator. Lines are the unit of parsing.
    #[token("\n")]
    Newline,

    /// Mnemonics, labels, constants and register names. Dots are part of
    /// the identifier so `movb.i2r` lexes as one token.
    #[regex(r"[A-Za-z_][A-Za-z0-9_.]*")]
    Ident,

    /// Integer literal: decimal, hex or binary, with optional `_`
    /// separators.
    #[regex(r"[0-9][0-9_]*")]
    #[regex(r"0[xX][0-9a-fA-F][0-9a-fA-F_]*")]
    #[regex(r"0[bB][01][01_]*")]
    Number,

    #[regex(r"'(\\.|[^\\'])'")]
    Char,

    #[regex(r#""(\\.|[^"\\])*""#)]
    Str,

    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token("=")]
    Equals,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
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
    #[token("<<")]
    ShiftLeft,
    #[token(">>")]
    ShiftRight,
    #[token("&")]
    Ampersand,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,
}

/// A token plus where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lexeme<'a> {
    pub token: Token,
    pub span: Range<usize>,
    pub text: &'a str,
}

/// Lexes the whole source into a lexeme list, error tokens included.
#[must_use]
pub fn lex(source: &str) -> Vec<Lexeme<'_>> {
    let mut lexer = Token::lexer(source);
    let mut out = Vec::new();
    while let Some(token) = lexer.next() {
        out.push(Lexeme {
            token,
            span: lexer.span(),
            text: lexer.slice(),
        });
    }
    out
}

/// Parses an integer literal, handling `0x`, `0b` and `_` separators.
#[must_use]
pub fn parse_number(text: &str) -> Option<i128> {
    let cleaned: String = text.chars().filter(|&c| c != '_').collect();
    if let Some(hex) = cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        i128::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = cleaned.strip_prefix("0b").or_else(|| cleaned.strip_prefix("0B")) {
        i128::from_str_radix(bin, 2).ok()
    } else {
        cleaned.parse().ok()
    }
}

fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        'r' => '\r',
        't' => '\t',
        '0' => '\0',
        other => other,
    }
}

/// Value of a character literal like `'x'` or `'\n'`.
#[must_use]
pub fn parse_char(text: &str) -> Option<i128> {
    let inner = text.strip_prefix('\'')?.strip_suffix('\'')?;
    let mut chars = inner.chars();
    let value = match chars.next()? {
        '\\' => unescape(chars.next()?),
        c => c,
    };
    if chars.next().is_some() {
        return None;
    }
    Some(value as i128)
}

/// Contents of a string literal, with escapes resolved.
#[must_use]
pub fn parse_string(text: &str) -> Option<String> {
    let inner = text.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(unescape(chars.next()?)),
            c => out.push(c),
        }
    }
    Some(out)
}
