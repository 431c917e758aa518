//! Assembly error reporting.
//!
//! Every error carries a byte span into the source; rendering produces a
//! compiler-style diagnostic with the offending line and column.

use codespan_reporting::diagnostic::{Diagnostic, Label};
use codespan_reporting::files::SimpleFile;
use codespan_reporting::term;
use codespan_reporting::term::termcolor::{ColorChoice, NoColor, StandardStream};
use std::fmt::{self, Display, Formatter};
use std::ops::Range;

/// What went wrong during assembly.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum AssemblyErrorKind {
    #[display(fmt = "syntax error: {}", _0)]
    Syntax(String),
    #[display(fmt = "undefined symbol `{}`", _0)]
    UndefinedSymbol(String),
    #[display(fmt = "symbol `{}` is already defined", _0)]
    RedefinedSymbol(String),
    #[display(fmt = "ambiguous instruction `{}`, spell out the addressing suffix", _0)]
    AmbiguousInstruction(String),
    #[display(fmt = "value {} does not fit in {} bits", value, bits)]
    OutOfRange { value: i128, bits: u32 },
    #[display(fmt = "division by zero in constant expression")]
    DivByZeroInConstExpr,
}

/// An assembly error with its source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyError {
    pub kind: AssemblyErrorKind,
    pub span: Range<usize>,
}

impl AssemblyError {
    #[must_use]
    pub fn new(kind: AssemblyErrorKind, span: Range<usize>) -> Self {
        Self { kind, span }
    }
}

impl Display for AssemblyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for AssemblyError {}

fn diagnostic(error: &AssemblyError) -> Diagnostic<()> {
    Diagnostic::error()
        .with_message(error.kind.to_string())
        .with_labels(vec![Label::primary((), error.span.clone())])
}

/// Renders the diagnostic to a plain string, line and column included.
#[must_use]
pub fn render(file_name: &str, source: &str, error: &AssemblyError) -> String {
    let file = SimpleFile::new(file_name, source);
    let mut buffer = NoColor::new(Vec::new());
    let config = term::Config::default();
    if term::emit(&mut buffer, &config, &file, &diagnostic(error)).is_err() {
        return error.to_string();
    }
    String::from_utf8_lossy(buffer.get_ref()).into_owned()
}

/// Emits the diagnostic to stderr with color when available.
pub fn emit(file_name: &str, source: &str, error: &AssemblyError) {
    let file = SimpleFile::new(file_name, source);
    let writer = StandardStream::stderr(ColorChoice::Auto);
    let config = term::Config::default();
    if term::emit(&mut writer.lock(), &config, &file, &diagnostic(error)).is_err() {
        eprintln!("error: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_names_the_symbol_and_line() {
        let source = "halt\njmp does_not_exist\n";
        let offset = source.find("does_not_exist").unwrap();
        let error = AssemblyError::new(
            AssemblyErrorKind::UndefinedSymbol("does_not_exist".to_string()),
            offset..offset + "does_not_exist".len(),
        );

        let rendered = render("prog.evil", source, &error);
        assert!(rendered.contains("does_not_exist"));
        assert!(rendered.contains("prog.evil:2"));
    }

    #[test]
    fn kinds_have_readable_messages() {
        assert_eq!(
            AssemblyErrorKind::OutOfRange { value: 300, bits: 8 }.to_string(),
            "value 300 does not fit in 8 bits"
        );
        assert_eq!(
            AssemblyErrorKind::DivByZeroInConstExpr.to_string(),
            "division by zero in constant expression"
        );
    }
}
