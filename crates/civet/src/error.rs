//! Error types shared by the tokenizer, parser, compiler, VM and host API.
//!
//! Every fallible operation in the crate returns a `Result`. The public
//! [`Error`] carries a preformatted `file:line:col: message` string; the
//! internal [`RunError`] is what VM instruction handlers produce before the
//! dispatch loop attaches the current source location.

use std::fmt;

use strum::IntoStaticStr;

/// Result alias for operations that can produce a runtime error inside the VM.
pub(crate) type RunResult<T> = Result<T, RunError>;

/// A position in a source file: file id, 1-based line, column of the byte.
///
/// The file id indexes the program's file-name table; line and column are
/// 16-bit to match the compact source-location encoding in compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SrcLoc {
    pub(crate) file: u16,
    pub(crate) line: u16,
    pub(crate) col: u16,
}

impl SrcLoc {
    pub(crate) fn new(file: u16, line: u16, col: u16) -> Self {
        Self { file, line, col }
    }

    /// 1-based line number.
    #[must_use]
    pub fn line(self) -> u32 {
        u32::from(self.line)
    }

    /// Column of the first byte of the construct.
    #[must_use]
    pub fn col(self) -> u32 {
        u32::from(self.col)
    }
}

/// Which stage produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ErrorKind {
    /// Tokenizer failures: unterminated string, bad escape, invalid byte.
    Lex,
    /// Parser failures: unexpected token, missing delimiter.
    Parse,
    /// Compiler failures: register/constant exhaustion, bad assignment.
    Compile,
    /// VM failures, including errors raised by native functions.
    Runtime,
}

/// An error with its stage and a human-readable message.
///
/// Messages produced while source locations are known are prefixed with
/// `file:line:col: `; host-level errors (unknown function name, unreadable
/// file) carry the bare message.
#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a runtime error, the kind native functions report.
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub(crate) fn at(kind: ErrorKind, file_name: &str, loc: SrcLoc, message: impl fmt::Display) -> Self {
        Self::new(kind, format!("{file_name}:{}:{}: {message}", loc.line, loc.col))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Error {}

/// A runtime fault before the VM has attached a source location to it.
///
/// `User` errors are script-level faults (bad operand types, missing keys,
/// calling a non-function). `Internal` errors mean the interpreter state is
/// inconsistent; the VM dumps the offending frame for those before
/// unwinding.
#[derive(Debug)]
pub(crate) enum RunError {
    User(String),
    Internal(String),
}

impl RunError {
    pub(crate) fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub(crate) fn message(&self) -> &str {
        match self {
            Self::User(m) | Self::Internal(m) => m,
        }
    }
}
