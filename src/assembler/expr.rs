//! Constant expressions.
//!
//! Operand fields and `NAME = ...` bindings accept integer expressions
//! with C-like precedence: unary `~` and `-`, then `* / %`, `+ -`,
//! `<< >>`, `&`, `^`, `|`. The `sizeof(b|w|a)` pseudo-operator resolves
//! to the encoded cell count of the operand class.

use super::diagnostics::{AssemblyError, AssemblyErrorKind};
use super::token::{self, Lexeme, Token};
use super::SymbolTable;
use crate::options::Options;
use crate::registers::Width;
use std::ops::Range;

/// A parsed constant expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Expr {
    pub kind: ExprKind,
    pub span: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum ExprKind {
    Number(i128),
    Symbol(String),
    Sizeof(Width),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    And,
    Or,
    Xor,
}

impl BinaryOp {
    fn from_token(token: Token) -> Option<(Self, u8)> {
        // C-like precedence, higher binds tighter.
        Some(match token {
            Token::Pipe => (BinaryOp::Or, 1),
            Token::Caret => (BinaryOp::Xor, 2),
            Token::Ampersand => (BinaryOp::And, 3),
            Token::ShiftLeft => (BinaryOp::Shl, 4),
            Token::ShiftRight => (BinaryOp::Shr, 4),
            Token::Plus => (BinaryOp::Add, 5),
            Token::Minus => (BinaryOp::Sub, 5),
            Token::Star => (BinaryOp::Mul, 6),
            Token::Slash => (BinaryOp::Div, 6),
            Token::Percent => (BinaryOp::Mod, 6),
            _ => return None,
        })
    }
}

/// A peekable window over one line of lexemes.
#[derive(Debug)]
pub(super) struct Cursor<'a, 'src> {
    lexemes: &'a [Lexeme<'src>],
    pos: usize,
    /// Span reported when the line ends unexpectedly.
    end_span: Range<usize>,
}

impl<'a, 'src> Cursor<'a, 'src> {
    pub fn new(lexemes: &'a [Lexeme<'src>], end_span: Range<usize>) -> Self {
        Self {
            lexemes,
            pos: 0,
            end_span,
        }
    }

    pub fn peek(&self) -> Option<&Lexeme<'src>> {
        self.lexemes.get(self.pos)
    }

    pub fn peek_second(&self) -> Option<&Lexeme<'src>> {
        self.lexemes.get(self.pos + 1)
    }

    pub fn next(&mut self) -> Option<&Lexeme<'src>> {
        let lexeme = self.lexemes.get(self.pos);
        if lexeme.is_some() {
            self.pos += 1;
        }
        lexeme
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.lexemes.len()
    }

    /// Span of the upcoming lexeme, or of the line end.
    pub fn here(&self) -> Range<usize> {
        self.peek()
            .map(|lexeme| lexeme.span.clone())
            .unwrap_or_else(|| self.end_span.clone())
    }

    fn syntax(&self, message: &str) -> AssemblyError {
        AssemblyError::new(AssemblyErrorKind::Syntax(message.to_string()), self.here())
    }
}

/// Parses one expression off the cursor.
pub(super) fn parse(cursor: &mut Cursor<'_, '_>) -> Result<Expr, AssemblyError> {
    parse_binary(cursor, 1)
}

fn parse_binary(cursor: &mut Cursor<'_, '_>, min_prec: u8) -> Result<Expr, AssemblyError> {
    let mut lhs = parse_unary(cursor)?;

    while let Some((op, prec)) = cursor.peek().and_then(|l| BinaryOp::from_token(l.token)) {
        if prec < min_prec {
            break;
        }
        cursor.next();

        let rhs = parse_binary(cursor, prec + 1)?;
        let span = lhs.span.start..rhs.span.end;
        lhs = Expr {
            kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
            span,
        };
    }

    Ok(lhs)
}

fn parse_unary(cursor: &mut Cursor<'_, '_>) -> Result<Expr, AssemblyError> {
    let op = match cursor.peek().map(|l| l.token) {
        Some(Token::Tilde) => Some(UnaryOp::Not),
        Some(Token::Minus) => Some(UnaryOp::Neg),
        _ => None,
    };

    if let Some(op) = op {
        let start = cursor.here().start;
        cursor.next();
        let operand = parse_unary(cursor)?;
        let span = start..operand.span.end;
        return Ok(Expr {
            kind: ExprKind::Unary(op, Box::new(operand)),
            span,
        });
    }

    parse_primary(cursor)
}

fn parse_primary(cursor: &mut Cursor<'_, '_>) -> Result<Expr, AssemblyError> {
    let lexeme = match cursor.next() {
        Some(lexeme) => lexeme.clone(),
        None => {
            let err = AssemblyError::new(
                AssemblyErrorKind::Syntax("expected an expression".to_string()),
                cursor.end_span.clone(),
            );
            return Err(err);
        }
    };

    match lexeme.token {
        Token::Number => {
            let value = token::parse_number(lexeme.text).ok_or_else(|| {
                AssemblyError::new(
                    AssemblyErrorKind::Syntax(format!("bad integer literal `{}`", lexeme.text)),
                    lexeme.span.clone(),
                )
            })?;
            Ok(Expr {
                kind: ExprKind::Number(value),
                span: lexeme.span,
            })
        }
        Token::Char => {
            let value = token::parse_char(lexeme.text).ok_or_else(|| {
                AssemblyError::new(
                    AssemblyErrorKind::Syntax(format!("bad character literal `{}`", lexeme.text)),
                    lexeme.span.clone(),
                )
            })?;
            Ok(Expr {
                kind: ExprKind::Number(value),
                span: lexeme.span,
            })
        }
        Token::LParen => {
            let inner = parse(cursor)?;
            match cursor.next() {
                Some(l) if l.token == Token::RParen => Ok(Expr {
                    span: lexeme.span.start..l.span.end,
                    kind: inner.kind,
                }),
                _ => Err(AssemblyError::new(
                    AssemblyErrorKind::Syntax("expected `)`".to_string()),
                    cursor.here(),
                )),
            }
        }
        Token::Ident if lexeme.text == "sizeof" => parse_sizeof(cursor, lexeme.span),
        Token::Ident => Ok(Expr {
            kind: ExprKind::Symbol(lexeme.text.to_string()),
            span: lexeme.span,
        }),
        _ => Err(AssemblyError::new(
            AssemblyErrorKind::Syntax(format!("unexpected `{}`", lexeme.text)),
            lexeme.span,
        )),
    }
}

fn parse_sizeof(cursor: &mut Cursor<'_, '_>, start: Range<usize>) -> Result<Expr, AssemblyError> {
    match cursor.next() {
        Some(l) if l.token == Token::LParen => {}
        _ => return Err(cursor.syntax("expected `(` after sizeof")),
    }

    let width = match cursor.next() {
        Some(l) if l.token == Token::Ident => match l.text {
            "b" => Width::Byte,
            "w" => Width::Word,
            "a" => Width::Addr,
            other => {
                return Err(AssemblyError::new(
                    AssemblyErrorKind::Syntax(format!(
                        "sizeof expects `b`, `w` or `a`, got `{}`",
                        other
                    )),
                    l.span.clone(),
                ))
            }
        },
        _ => return Err(cursor.syntax("sizeof expects `b`, `w` or `a`")),
    };

    let end = match cursor.next() {
        Some(l) if l.token == Token::RParen => l.span.end,
        _ => return Err(cursor.syntax("expected `)`")),
    };

    Ok(Expr {
        kind: ExprKind::Sizeof(width),
        span: start.start..end,
    })
}

impl Expr {
    /// The symbol name when this expression is a bare identifier.
    pub fn as_symbol(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Symbol(name) => Some(name),
            _ => None,
        }
    }

    /// Evaluates the expression over the symbol table.
    pub fn eval(&self, symbols: &SymbolTable, options: &Options) -> Result<i128, AssemblyError> {
        match &self.kind {
            ExprKind::Number(value) => Ok(*value),
            ExprKind::Symbol(name) => symbols.value(name).ok_or_else(|| {
                AssemblyError::new(
                    AssemblyErrorKind::UndefinedSymbol(name.clone()),
                    self.span.clone(),
                )
            }),
            ExprKind::Sizeof(width) => Ok(width.cells(options) as i128),
            ExprKind::Unary(UnaryOp::Not, operand) => Ok(!operand.eval(symbols, options)?),
            ExprKind::Unary(UnaryOp::Neg, operand) => {
                Ok(operand.eval(symbols, options)?.wrapping_neg())
            }
            ExprKind::Binary(op, lhs, rhs) => {
                let lhs_val = lhs.eval(symbols, options)?;
                let rhs_val = rhs.eval(symbols, options)?;
                self.apply(*op, lhs_val, rhs_val)
            }
        }
    }

    fn apply(&self, op: BinaryOp, lhs: i128, rhs: i128) -> Result<i128, AssemblyError> {
        let div_by_zero =
            || AssemblyError::new(AssemblyErrorKind::DivByZeroInConstExpr, self.span.clone());

        Ok(match op {
            BinaryOp::Add => lhs.wrapping_add(rhs),
            BinaryOp::Sub => lhs.wrapping_sub(rhs),
            BinaryOp::Mul => lhs.wrapping_mul(rhs),
            BinaryOp::Div => lhs.checked_div(rhs).ok_or_else(div_by_zero)?,
            BinaryOp::Mod => lhs.checked_rem(rhs).ok_or_else(div_by_zero)?,
            BinaryOp::Shl => {
                if (0..128).contains(&rhs) {
                    lhs.checked_shl(rhs as u32).unwrap_or(0)
                } else {
                    0
                }
            }
            BinaryOp::Shr => {
                if (0..128).contains(&rhs) {
                    lhs.checked_shr(rhs as u32).unwrap_or(0)
                } else {
                    0
                }
            }
            BinaryOp::And => lhs & rhs,
            BinaryOp::Or => lhs | rhs,
            BinaryOp::Xor => lhs ^ rhs,
        })
    }
}
