use std::fmt;
use std::sync::Arc;

/// A position in a source file. Lines and columns are 1-based, the byte
/// offset is 0-based.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilePos {
    pub line: u32,
    pub column: u32,
    pub offset: u32,
}

impl FilePos {
    pub fn new(line: u32, column: u32, offset: u32) -> Self {
        Self {
            line,
            column,
            offset,
        }
    }
}

/// A half-open byte range in a named source file, kept on every token,
/// AST node and diagnostic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceRange {
    pub file: Arc<str>,
    pub begin: FilePos,
    pub end: FilePos,
}

impl Default for SourceRange {
    fn default() -> Self {
        Self {
            file: Arc::from(""),
            begin: FilePos::default(),
            end: FilePos::default(),
        }
    }
}

impl SourceRange {
    pub fn new(file: Arc<str>, begin: FilePos, end: FilePos) -> Self {
        Self { file, begin, end }
    }

    /// A range for things that have no real source position (injected
    /// symbols, link-time diagnostics).
    pub fn builtin(file: &str) -> Self {
        Self {
            file: Arc::from(file),
            begin: FilePos::default(),
            end: FilePos::default(),
        }
    }

    /// Smallest range covering both inputs. Assumes same file.
    pub fn span(&self, other: &SourceRange) -> SourceRange {
        SourceRange {
            file: self.file.clone(),
            begin: self.begin,
            end: other.end,
        }
    }
}

impl fmt::Display for SourceRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.file, self.begin.line, self.begin.column
        )
    }
}
