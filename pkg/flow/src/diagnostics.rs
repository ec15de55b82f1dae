use std::fmt;

use crate::source::SourceRange;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticKind {
    TokenError,
    SyntaxError,
    TypeError,
    LinkError,
    Warning,
}

impl DiagnosticKind {
    pub fn is_error(&self) -> bool {
        !matches!(self, DiagnosticKind::Warning)
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DiagnosticKind::TokenError => write!(f, "token error"),
            DiagnosticKind::SyntaxError => write!(f, "syntax error"),
            DiagnosticKind::TypeError => write!(f, "type error"),
            DiagnosticKind::LinkError => write!(f, "link error"),
            DiagnosticKind::Warning => write!(f, "warning"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub range: SourceRange,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}: {}", self.range, self.kind, self.message)
    }
}

/// Accumulator for compile-time diagnostics. Compilation fails iff at least
/// one non-warning diagnostic was recorded.
#[derive(Default)]
pub struct Report {
    diagnostics: Vec<Diagnostic>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: DiagnosticKind, range: SourceRange, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            kind,
            range,
            message: message.into(),
        });
    }

    pub fn token_error(&mut self, range: SourceRange, message: impl Into<String>) {
        self.add(DiagnosticKind::TokenError, range, message);
    }

    pub fn syntax_error(&mut self, range: SourceRange, message: impl Into<String>) {
        self.add(DiagnosticKind::SyntaxError, range, message);
    }

    pub fn type_error(&mut self, range: SourceRange, message: impl Into<String>) {
        self.add(DiagnosticKind::TypeError, range, message);
    }

    pub fn link_error(&mut self, range: SourceRange, message: impl Into<String>) {
        self.add(DiagnosticKind::LinkError, range, message);
    }

    pub fn warning(&mut self, range: SourceRange, message: impl Into<String>) {
        self.add(DiagnosticKind::Warning, range, message);
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.kind.is_error())
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}
