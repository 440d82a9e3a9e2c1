//! Error values for compilation and execution.
//!
//! Compile errors are collected per compilation so a single run can report
//! several diagnostics. Runtime errors carry the message and a frame-by-frame
//! trace; rendering to stderr is the host's job (the CLI prints them, tests
//! match on them).

use std::fmt::{self, Display, Write};

/// Where a compile error was noticed.
///
/// Scanner errors carry their message in the token itself, so they have no
/// meaningful lexeme to point at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorAt {
    /// End of input.
    End,
    /// The offending lexeme.
    Token(String),
    /// No location (scanner error tokens).
    Nowhere,
}

/// A single diagnostic produced by the scanner or compiler.
///
/// Renders as `[line N] Error at 'x': message` (or ` at end`, or no
/// location).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    /// 1-based source line.
    pub line: u32,
    pub at: ErrorAt,
    /// Human-readable message, e.g. `Expect ')' after arguments.`.
    pub message: String,
}

impl Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.at {
            ErrorAt::End => write!(f, " at end")?,
            ErrorAt::Token(lexeme) => write!(f, " at '{lexeme}'")?,
            ErrorAt::Nowhere => {}
        }
        write!(f, ": {}", self.message)
    }
}

/// One entry of a runtime stack trace, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// 1-based source line of the instruction being executed.
    pub line: u32,
    /// Function name, or `None` for the top-level script.
    pub function: Option<String>,
}

impl Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(name) => write!(f, "[line {}] in {name}()", self.line),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// A runtime error: the message plus the call-stack trace at the point of
/// failure, innermost frame first and ending with the script frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        let mut first = true;
        for frame in &self.trace {
            if !first {
                f.write_char('\n')?;
            }
            write!(f, "{frame}")?;
            first = false;
        }
        Ok(())
    }
}

/// Top-level error type returned by [`crate::Runner`].
#[derive(Debug, Clone, PartialEq)]
pub enum CmelError {
    /// One or more scanner/compiler diagnostics; nothing was executed.
    Compile(Vec<CompileError>),
    /// Execution halted; the stack was reset.
    Runtime(RuntimeError),
}

impl Display for CmelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile(errors) => {
                let mut first = true;
                for error in errors {
                    if !first {
                        f.write_char('\n')?;
                    }
                    write!(f, "{error}")?;
                    first = false;
                }
                Ok(())
            }
            Self::Runtime(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for CmelError {}

/// Error produced inside the VM loop and native functions.
///
/// `Raise` is a fresh error that still needs trace capture and test-mode
/// handling by the innermost dispatch loop. `Fatal` has already been through
/// that handling in a nested run and only propagates outward.
#[derive(Debug)]
pub(crate) enum VmError {
    Raise(String),
    Fatal(Box<RuntimeError>),
}

/// Result alias used throughout the VM and natives.
pub(crate) type RunResult<T> = Result<T, VmError>;

/// Shorthand for raising a runtime error from deep in the interpreter.
pub(crate) fn raise<T, M: Into<String>>(message: M) -> RunResult<T> {
    Err(VmError::Raise(message.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_display() {
        let err = CompileError {
            line: 3,
            at: ErrorAt::Token(";".to_owned()),
            message: "Expect expression.".to_owned(),
        };
        assert_eq!(err.to_string(), "[line 3] Error at ';': Expect expression.");

        let eof = CompileError {
            line: 7,
            at: ErrorAt::End,
            message: "Expect '}' after block.".to_owned(),
        };
        assert_eq!(eof.to_string(), "[line 7] Error at end: Expect '}' after block.");

        let scan = CompileError {
            line: 1,
            at: ErrorAt::Nowhere,
            message: "Unterminated string.".to_owned(),
        };
        assert_eq!(scan.to_string(), "[line 1] Error: Unterminated string.");
    }

    #[test]
    fn runtime_error_display_ends_with_script() {
        let err = RuntimeError {
            message: "Undefined variable 'x'.".to_owned(),
            trace: vec![
                TraceFrame {
                    line: 2,
                    function: Some("inner".to_owned()),
                },
                TraceFrame { line: 5, function: None },
            ],
        };
        let rendered = err.to_string();
        assert!(rendered.starts_with("Undefined variable 'x'.\n"));
        assert!(rendered.ends_with("[line 5] in script"));
    }
}
