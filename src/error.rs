//! Error types for nap

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using [`NapError`]
pub type Result<T> = std::result::Result<T, NapError>;

/// Malformed specification text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Errors that abort an invocation (as opposed to a single step).
#[derive(Error, Debug)]
pub enum NapError {
    #[error("Parse error in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl NapError {
    /// Process exit code for an invocation that ended with this error.
    pub fn exit_code(&self) -> i32 {
        2
    }
}

/// Read a request, playlist or script file.
pub(crate) fn read_file(path: &std::path::Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| NapError::Io {
        path: path.to_path_buf(),
        source,
    })
}
