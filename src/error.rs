//! Error and diagnostic types.
//!
//! Compile errors are accumulated and reported through [`ErrorCallback`]
//! (see `config.rs`) as the host sees them; runtime errors are carried as a
//! [`crate::value::Value`] on the current fiber and surfaced to the host as
//! a [`InterpretResult`].

use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

/// The three kinds of error report the host callback receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Compile,
    Runtime,
    StackTrace,
}

/// Outcome of `interpret`/`Fiber::call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Success,
    CompileError,
    RuntimeError,
}

/// A single compiler diagnostic with enough context for a `rustc`-style
/// rendering, and enough structure for the plain `(module, line, message)`
/// the host's `ErrorFn` callback actually receives.
#[derive(Debug, Error, Diagnostic)]
#[error("{message}")]
pub struct CompileDiagnostic {
    pub message: String,
    pub module: String,
    /// 1-based source line, or -1 if not applicable.
    pub line: i32,
    #[source_code]
    pub src: NamedSource<String>,
    #[label("here")]
    pub span: Option<SourceSpan>,
    pub code: &'static str,
}

impl CompileDiagnostic {
    pub fn new(module: &str, line: i32, message: impl Into<String>) -> Self {
        CompileDiagnostic {
            message: message.into(),
            module: module.to_string(),
            line,
            src: NamedSource::new(module.to_string(), String::new()),
            span: None,
            code: "LUM-100",
        }
    }
}

/// Lexer-level failures; folded into [`CompileDiagnostic`] by the compiler
/// but kept distinct so the lexer has no dependency on the compiler.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LexError {
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("unterminated string")]
    UnterminatedString,
    #[error("invalid escape sequence")]
    InvalidEscape,
    #[error("invalid number literal '{0}'")]
    InvalidNumber(String),
    #[error("interpolation nesting too deep (max 8)")]
    InterpolationTooDeep,
}

/// A runtime error value, wrapped only so the VM can distinguish "error
/// raised" from "normal value" at the Rust type level before it's stuffed
/// into `fiber.error` as a plain [`crate::value::Value`].
#[derive(Debug, Clone)]
pub struct RuntimeFault(pub String);

impl RuntimeFault {
    pub fn new(msg: impl Into<String>) -> Self {
        RuntimeFault(msg.into())
    }
}

impl std::fmt::Display for RuntimeFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
