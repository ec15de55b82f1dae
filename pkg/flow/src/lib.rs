#[macro_use]
extern crate log;

pub mod analyzer;
pub mod ast;
pub mod codegen;
pub mod diagnostics;
pub mod instruction;
pub mod lexer;
pub mod parser;
pub mod program;
pub mod runtime;
pub mod source;
pub mod token;
pub mod value;
pub mod vm;

use crate::diagnostics::Report;
use crate::program::Program;
use crate::runtime::Runtime;

/// Result of running the full pipeline over one source unit.
///
/// `program` is present iff no error diagnostic was produced; the report may
/// still carry warnings in that case.
pub struct Compilation {
    pub program: Option<Program>,
    pub report: Report,
}

/// Compiles a Flow source unit and links it against the given runtime.
pub fn compile(source: &str, filename: &str, runtime: &Runtime) -> Compilation {
    let mut report = Report::new();

    let tokens = lexer::Lexer::new(source, filename);
    let mut unit = match parser::parse_unit(tokens, &mut report) {
        Some(unit) => unit,
        None => {
            return Compilation {
                program: None,
                report,
            }
        }
    };

    let analysis = analyzer::analyze(&mut unit, runtime, &mut report);
    if report.has_errors() {
        return Compilation {
            program: None,
            report,
        };
    }

    let mut program = match codegen::generate(&unit, &analysis, runtime, &mut report) {
        Some(program) => program,
        None => {
            return Compilation {
                program: None,
                report,
            }
        }
    };

    if let Err(unresolved) = program.link(runtime) {
        for signature in unresolved {
            report.link_error(
                source::SourceRange::builtin(filename),
                format!("unresolved native signature: {}", signature),
            );
        }
        return Compilation {
            program: None,
            report,
        };
    }

    Compilation {
        program: Some(program),
        report,
    }
}
