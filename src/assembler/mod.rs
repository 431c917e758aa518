//! The assembler: a two-pass translator from textual source to a program
//! image.
//!
//! Pass one walks the parsed lines, binds `NAME = expr` constants, assigns
//! every label its cell offset and computes each instruction's encoded
//! length from the resolved opcode. Pass two evaluates operand expressions
//! against the now complete symbol table and emits cells, packing every
//! operand with the endianness selected by its opcode's parity.

pub mod diagnostics;
mod expr;
pub mod token;

pub use diagnostics::{AssemblyError, AssemblyErrorKind};

use crate::dump::make_cells_dump;
use crate::endian;
use crate::instruction::{ArgKind, OpClass, Opcode, AddrMode};
use crate::options::Options;
use crate::registers::{Register, Width};
use expr::{Cursor, Expr};
use log::debug;
use std::collections::HashMap;
use std::ops::Range;
use token::{Lexeme, Token};

/// How a symbol came to be defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SymbolKind {
    Label,
    Constant,
}

#[derive(Debug, Clone)]
struct Symbol {
    value: i128,
    kind: SymbolKind,
}

/// Labels and constants known to the assembler.
#[derive(Debug, Default)]
pub(crate) struct SymbolTable {
    symbols: HashMap<String, Symbol>,
}

impl SymbolTable {
    fn define(
        &mut self,
        name: &str,
        value: i128,
        kind: SymbolKind,
        span: Range<usize>,
    ) -> Result<(), AssemblyError> {
        if self.symbols.contains_key(name) {
            return Err(AssemblyError::new(
                AssemblyErrorKind::RedefinedSymbol(name.to_string()),
                span,
            ));
        }
        self.symbols.insert(name.to_string(), Symbol { value, kind });
        Ok(())
    }

    pub(crate) fn value(&self, name: &str) -> Option<i128> {
        self.symbols.get(name).map(|symbol| symbol.value)
    }

    fn is_label(&self, name: &str) -> bool {
        self.symbols
            .get(name)
            .map(|symbol| symbol.kind == SymbolKind::Label)
            .unwrap_or(false)
    }
}

/// One instruction operand as written.
#[derive(Debug, Clone)]
enum Operand {
    Reg(Register, Range<usize>),
    Expr(Expr),
}

impl Operand {
    fn span(&self) -> Range<usize> {
        match self {
            Operand::Reg(_, span) => span.clone(),
            Operand::Expr(expr) => expr.span.clone(),
        }
    }
}

/// The body of one parsed line, label stripped.
#[derive(Debug)]
enum Body {
    Constant {
        name: String,
        name_span: Range<usize>,
        expr: Expr,
    },
    Data {
        width: Width,
        items: Vec<Expr>,
    },
    Instr {
        mnemonic: String,
        span: Range<usize>,
        operands: Vec<Operand>,
    },
}

#[derive(Debug)]
struct Line {
    label: Option<(String, Range<usize>)>,
    body: Option<Body>,
}

/// Pass-one output: everything pass two needs to emit cells.
#[derive(Debug)]
enum Item {
    Instr {
        op: Opcode,
        operands: Vec<Operand>,
        offset: usize,
    },
    Data {
        width: Width,
        items: Vec<Expr>,
    },
}

/// Assembles source text into a program image.
pub fn assemble(source: &str, options: &Options) -> Result<Vec<u64>, AssemblyError> {
    Assembler::new(options).assemble(source)
}

#[derive(Debug)]
struct Assembler<'opts> {
    options: &'opts Options,
    symbols: SymbolTable,
}

impl<'opts> Assembler<'opts> {
    fn new(options: &'opts Options) -> Self {
        Self {
            options,
            symbols: SymbolTable::default(),
        }
    }

    fn assemble(&mut self, source: &str) -> Result<Vec<u64>, AssemblyError> {
        let lexemes = token::lex(source);
        let lines = split_lines(&lexemes, source.len());

        // Pass 1: parse, bind constants, place labels, size instructions.
        let mut items = Vec::new();
        let mut offset = 0usize;
        for (line_lexemes, end_span) in lines {
            let line = parse_line(line_lexemes, end_span)?;

            if let Some((name, span)) = line.label {
                self.symbols
                    .define(&name, offset as i128, SymbolKind::Label, span)?;
            }

            match line.body {
                None => {}
                Some(Body::Constant {
                    name,
                    name_span,
                    expr,
                }) => {
                    // Constants may only reference symbols defined above.
                    let value = expr.eval(&self.symbols, self.options)?;
                    self.symbols
                        .define(&name, value, SymbolKind::Constant, name_span)?;
                }
                Some(Body::Instr {
                    mnemonic,
                    span,
                    operands,
                }) => {
                    let op = resolve_opcode(&mnemonic, &operands, span)?;
                    items.push(Item::Instr {
                        op,
                        operands,
                        offset,
                    });
                    offset += op.encoded_size(self.options);
                }
                Some(Body::Data { width, items: data }) => {
                    offset += width.cells(self.options) * data.len();
                    items.push(Item::Data { width, items: data });
                }
            }
        }

        // Pass 2: evaluate operands and emit cells.
        let mut image = Vec::with_capacity(offset);
        for item in items {
            match item {
                Item::Instr {
                    op,
                    operands,
                    offset,
                } => self.emit_instruction(&mut image, op, &operands, offset)?,
                Item::Data { width, items } => self.emit_data(&mut image, width, &items)?,
            }
        }

        debug!(
            "bytecode:\n{}",
            make_cells_dump(&image, self.options.char_bit, 8)
        );

        Ok(image)
    }

    fn emit_instruction(
        &self,
        image: &mut Vec<u64>,
        op: Opcode,
        operands: &[Operand],
        offset: usize,
    ) -> Result<(), AssemblyError> {
        image.push(op as u64);
        let end_addr = (offset + op.encoded_size(self.options)) as i128;

        for (kind, operand) in op.args().iter().zip(operands) {
            let bits = kind.bits(self.options);
            let value = match operand {
                Operand::Reg(reg, _) => i128::from(reg.id()),
                Operand::Expr(expr) => {
                    let mut value = expr.eval(&self.symbols, self.options)?;
                    // A bare label in a `.rel` instruction becomes a
                    // displacement from the end of the instruction.
                    if is_relative(op)
                        && *kind == ArgKind::Addr
                        && expr.as_symbol().map_or(false, |n| self.symbols.is_label(n))
                    {
                        value -= end_addr;
                    }
                    value
                }
            };

            if !fits(value, bits) {
                return Err(AssemblyError::new(
                    AssemblyErrorKind::OutOfRange { value, bits },
                    operand.span(),
                ));
            }

            image.extend(endian::cells_from_value(
                op.endianness(),
                value as u128,
                self.options.char_bit,
                kind.cells(self.options),
            ));
        }

        Ok(())
    }

    fn emit_data(
        &self,
        image: &mut Vec<u64>,
        width: Width,
        items: &[Expr],
    ) -> Result<(), AssemblyError> {
        let bits = width.bits(self.options);
        for item in items {
            let value = item.eval(&self.symbols, self.options)?;
            if !fits(value, bits) {
                return Err(AssemblyError::new(
                    AssemblyErrorKind::OutOfRange { value, bits },
                    item.span.clone(),
                ));
            }
            // Data lives in program space in the in-memory layout, which
            // is little-endian regardless of any opcode.
            image.extend(endian::cells_from_value(
                endian::Endianness::Little,
                value as u128,
                self.options.char_bit,
                width.cells(self.options),
            ));
        }
        Ok(())
    }
}

/// A signed value fits a `bits`-wide operand when it lies in
/// `[-2^(bits-1), 2^bits)`.
fn fits(value: i128, bits: u32) -> bool {
    if value >= 0 {
        value as u128 <= endian::mask(bits)
    } else if bits >= 128 {
        true
    } else {
        value >= -(1i128 << (bits - 1))
    }
}

fn is_relative(op: Opcode) -> bool {
    matches!(
        op.class(),
        OpClass::Jump(_, AddrMode::Rel) | OpClass::Loop(AddrMode::Rel) | OpClass::Call(AddrMode::Rel)
    )
}

/// Picks the unique opcode matching a written mnemonic and operand shapes.
///
/// An exact mnemonic is looked up directly. A mnemonic written without its
/// addressing tail is resolved against every table entry sharing the base
/// name; zero matches is unknown, more than one is ambiguous.
fn resolve_opcode(
    mnemonic: &str,
    operands: &[Operand],
    span: Range<usize>,
) -> Result<Opcode, AssemblyError> {
    let shape_matches = |op: &Opcode| {
        op.args().len() == operands.len()
            && op.args().iter().zip(operands).all(|(kind, operand)| match kind {
                ArgKind::Reg => matches!(operand, Operand::Reg(..)),
                _ => matches!(operand, Operand::Expr(_)),
            })
    };

    let exact: Vec<Opcode> = Opcode::ALL
        .iter()
        .filter(|op| op.mnemonic() == mnemonic)
        .copied()
        .collect();
    if !exact.is_empty() {
        return exact
            .iter()
            .find(|op| shape_matches(op))
            .copied()
            .ok_or_else(|| {
                AssemblyError::new(
                    AssemblyErrorKind::Syntax(format!(
                        "wrong operands for `{}`, expected {}",
                        mnemonic,
                        describe_args(exact[0])
                    )),
                    span,
                )
            });
    }

    let base = |name: &str| name.split('.').next().unwrap_or(name).to_string();
    let candidates: Vec<Opcode> = Opcode::ALL
        .iter()
        .filter(|op| base(op.mnemonic()) == mnemonic && shape_matches(op))
        .copied()
        .collect();

    match candidates.as_slice() {
        [] => Err(AssemblyError::new(
            AssemblyErrorKind::Syntax(format!("unknown instruction `{}`", mnemonic)),
            span,
        )),
        [op] => Ok(*op),
        _ => Err(AssemblyError::new(
            AssemblyErrorKind::AmbiguousInstruction(mnemonic.to_string()),
            span,
        )),
    }
}

fn describe_args(op: Opcode) -> String {
    let names: Vec<&str> = op
        .args()
        .iter()
        .map(|kind| match kind {
            ArgKind::Reg => "register",
            ArgKind::ImmByte => "byte",
            ArgKind::ImmWord => "word",
            ArgKind::Addr => "address",
        })
        .collect();
    if names.is_empty() {
        "no operands".to_string()
    } else {
        names.join(", ")
    }
}

/// Splits the lexeme list into lines, keeping each line's end span for
/// error reporting.
fn split_lines<'a, 'src>(
    lexemes: &'a [Lexeme<'src>],
    source_len: usize,
) -> Vec<(&'a [Lexeme<'src>], Range<usize>)> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (idx, lexeme) in lexemes.iter().enumerate() {
        if lexeme.token == Token::Newline {
            lines.push((&lexemes[start..idx], lexeme.span.clone()));
            start = idx + 1;
        }
    }
    lines.push((&lexemes[start..], source_len..source_len));
    lines
}

fn parse_line(lexemes: &[Lexeme<'_>], end_span: Range<usize>) -> Result<Line, AssemblyError> {
    if let Some(bad) = lexemes.iter().find(|l| l.token == Token::Error) {
        return Err(AssemblyError::new(
            AssemblyErrorKind::Syntax(format!("unexpected character `{}`", bad.text)),
            bad.span.clone(),
        ));
    }

    let mut cursor = Cursor::new(lexemes, end_span);
    let mut line = Line {
        label: None,
        body: None,
    };

    // Leading `name:` label.
    if let (Some(first), Some(second)) = (cursor.peek(), cursor.peek_second()) {
        if first.token == Token::Ident && second.token == Token::Colon {
            line.label = Some((first.text.to_string(), first.span.clone()));
            cursor.next();
            cursor.next();
        }
    }

    if cursor.at_end() {
        return Ok(line);
    }

    let head = match cursor.peek() {
        Some(lexeme) if lexeme.token == Token::Ident => lexeme.clone(),
        Some(lexeme) => {
            return Err(AssemblyError::new(
                AssemblyErrorKind::Syntax(format!("expected an instruction, got `{}`", lexeme.text)),
                lexeme.span.clone(),
            ))
        }
        None => return Ok(line),
    };

    // `NAME = expr` constant binding.
    if cursor.peek_second().map(|l| l.token) == Some(Token::Equals) {
        cursor.next();
        cursor.next();
        let expr = expr::parse(&mut cursor)?;
        expect_line_end(&cursor)?;
        line.body = Some(Body::Constant {
            name: head.text.to_string(),
            name_span: head.span,
            expr,
        });
        return Ok(line);
    }

    cursor.next();

    match head.text {
        "db" | "dw" | "da" => {
            let width = match head.text {
                "db" => Width::Byte,
                "dw" => Width::Word,
                _ => Width::Addr,
            };
            let items = parse_data_items(&mut cursor, width)?;
            line.body = Some(Body::Data { width, items });
        }
        _ => {
            let operands = parse_operands(&mut cursor)?;
            line.body = Some(Body::Instr {
                mnemonic: head.text.to_string(),
                span: head.span,
                operands,
            });
        }
    }

    Ok(line)
}

fn expect_line_end(cursor: &Cursor<'_, '_>) -> Result<(), AssemblyError> {
    match cursor.peek() {
        None => Ok(()),
        Some(lexeme) => Err(AssemblyError::new(
            AssemblyErrorKind::Syntax(format!("unexpected `{}`", lexeme.text)),
            lexeme.span.clone(),
        )),
    }
}

fn parse_data_items(
    cursor: &mut Cursor<'_, '_>,
    width: Width,
) -> Result<Vec<Expr>, AssemblyError> {
    let mut items = Vec::new();

    loop {
        match cursor.peek() {
            Some(lexeme) if lexeme.token == Token::Str => {
                if width != Width::Byte {
                    return Err(AssemblyError::new(
                        AssemblyErrorKind::Syntax(
                            "string literals are only valid in `db`".to_string(),
                        ),
                        lexeme.span.clone(),
                    ));
                }
                let text = token::parse_string(lexeme.text).ok_or_else(|| {
                    AssemblyError::new(
                        AssemblyErrorKind::Syntax(format!("bad string literal `{}`", lexeme.text)),
                        lexeme.span.clone(),
                    )
                })?;
                for c in text.chars() {
                    items.push(Expr {
                        kind: expr::ExprKind::Number(c as i128),
                        span: lexeme.span.clone(),
                    });
                }
                cursor.next();
            }
            _ => items.push(expr::parse(cursor)?),
        }

        match cursor.peek() {
            None => break,
            Some(lexeme) if lexeme.token == Token::Comma => {
                cursor.next();
            }
            Some(lexeme) => {
                return Err(AssemblyError::new(
                    AssemblyErrorKind::Syntax(format!("expected `,`, got `{}`", lexeme.text)),
                    lexeme.span.clone(),
                ))
            }
        }
    }

    Ok(items)
}

fn parse_operands(cursor: &mut Cursor<'_, '_>) -> Result<Vec<Operand>, AssemblyError> {
    let mut operands = Vec::new();
    if cursor.at_end() {
        return Ok(operands);
    }

    loop {
        // A lone identifier naming a register is a register operand;
        // anything else is an expression.
        let reg = match (cursor.peek(), cursor.peek_second()) {
            (Some(first), second)
                if first.token == Token::Ident
                    && second.map(|l| l.token == Token::Comma).unwrap_or(true) =>
            {
                Register::by_name(first.text).map(|reg| (reg, first.span.clone()))
            }
            _ => None,
        };

        match reg {
            Some((reg, span)) => {
                cursor.next();
                operands.push(Operand::Reg(reg, span));
            }
            None => operands.push(Operand::Expr(expr::parse(cursor)?)),
        }

        match cursor.peek() {
            None => break,
            Some(lexeme) if lexeme.token == Token::Comma => {
                cursor.next();
            }
            Some(lexeme) => {
                return Err(AssemblyError::new(
                    AssemblyErrorKind::Syntax(format!("expected `,`, got `{}`", lexeme.text)),
                    lexeme.span.clone(),
                ))
            }
        }
    }

    Ok(operands)
}
