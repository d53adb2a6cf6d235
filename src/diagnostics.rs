//! Error reporting for the lowering stage.
//!
//! Two kinds of failure exist. Mistakes in the source program (a label
//! declared twice, a `break` with nothing to break out of) are collected in
//! [`Diagnostics`] and lowering carries on so later errors are still found.
//! Inconsistencies in the tree handed to the backend are returned as a
//! [`LoweringError`] and abandon the function being compiled.

use colored::Colorize;
use thiserror::Error;

use crate::{backend::Register, intern::InternedSymbol};

pub type Result<T> = std::result::Result<T, LoweringError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiagnosticKind {
    #[error("label {0} already defined")]
    LabelRedeclared(InternedSymbol),
    #[error("label {0} not defined")]
    LabelNotDefined(InternedSymbol),
    #[error("break is not in a loop or switch")]
    BreakOutsideLoop,
    #[error("continue is not in a loop")]
    ContinueOutsideLoop,
    #[error("unreachable statements in a switch")]
    UnreachableInSwitch,
}

/// A recoverable error tied to the source line that caused it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub line: u32,
    /// Where in the backend the error was raised
    pub origin: Option<String>,
}

impl core::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} (at line {})", "error".red(), self.kind, self.line)?;

        if let Some(origin) = &self.origin {
            write!(f, "\n{}: {}", "backtrace".blue(), origin)?;
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    reported: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        log::trace!("reported {:?} at line {}", diagnostic.kind, diagnostic.line);
        self.reported.push(diagnostic);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.reported.iter()
    }

    pub fn len(&self) -> usize {
        self.reported.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reported.is_empty()
    }

    pub fn kinds(&self) -> Vec<DiagnosticKind> {
        self.reported.iter().map(|d| d.kind.clone()).collect()
    }

    /// Prints every collected diagnostic to stderr
    pub fn emit(&self) {
        for diagnostic in &self.reported {
            eprintln!("{diagnostic}");
        }
    }
}

macro_rules! function {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        type_name_of(f)
            .rsplit("::")
            .find(|&part| part != "f" && part != "{{closure}}")
            .unwrap_or("<unknown>")
    }};
}

pub(crate) use function;

/// Records a recoverable error against the current source line without
/// interrupting lowering
macro_rules! report_error {
    ($ctx:expr, $kind:expr $(,)?) => {{
        let origin = if cfg!(feature = "error-backtrace") {
            Some(format!(
                "{}::{} (at {}:{}:{})",
                module_path!(),
                $crate::diagnostics::function!(),
                file!(),
                line!(),
                column!()
            ))
        } else {
            None
        };

        let line = $ctx.line;
        $ctx.diagnostics.push($crate::diagnostics::Diagnostic {
            kind: $kind,
            line,
            origin,
        })
    }};
}

pub(crate) use report_error;

/// Internal inconsistencies that abort compilation of a function
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoweringError {
    #[error("parameter slot {0} has no matching declaration")]
    MissingParameterDeclaration(InternedSymbol),
    #[error("declaration {name} has storage class {actual}, expected {expected}")]
    StorageClassMismatch {
        name: InternedSymbol,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("unexpected node in {context}: {found}")]
    UnexpectedNode {
        context: &'static str,
        found: &'static str,
    },
    #[error("statement {0} cannot be lowered")]
    UnsupportedStatement(&'static str),
    #[error("values of type {0} are not supported here")]
    UnsupportedType(String),
    #[error("expression of type {0} cannot be called")]
    NotCallable(String),
    #[error("interface {interface} has no method {method}")]
    UnknownInterfaceMethod {
        interface: InternedSymbol,
        method: InternedSymbol,
    },
    #[error("expected {expected} values but found {actual}")]
    ArgumentCountMismatch { expected: usize, actual: usize },
    #[error("variable {0} has no frame slot")]
    MissingFrameSlot(InternedSymbol),
    #[error("out of registers")]
    RegistersExhausted,
    #[error("register {freed} released while {expected} is still live")]
    RegisterReleaseOrder { freed: Register, expected: Register },
    #[error("registers still allocated at end of function: {0}")]
    RegisterLeak(String),
    #[error("branch at instruction {0} was never resolved")]
    UnresolvedBranch(usize),
    #[error("invalid operand for {0}")]
    InvalidOperand(&'static str),
}
