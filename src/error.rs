//! Error types for tileserv.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Diagnostics attached to a stylesheet parse failure.
///
/// Carries everything needed to print a caret diagnostic: the source file,
/// the 1-based line and column, the offending line and the token class the
/// parser expected at that position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDiagnostics {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub line_content: String,
    pub expected: String,
}

impl fmt::Display for ParseDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}: expected {} in '{}'",
            self.file, self.line, self.column, self.expected, self.line_content
        )
    }
}

/// Error types for tile operations.
#[derive(Error, Debug)]
pub enum TileError {
    #[error("Malformed request: {0}")]
    BadRequest(String),

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("User request queue is full")]
    QueueFull,

    #[error("Stylesheet parse error: {0}")]
    Parse(ParseDiagnostics),

    #[error("Parsing of {path} exceeded {timeout_ms} ms")]
    ParseTimeout { path: PathBuf, timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Render error: {0}")]
    Render(String),
}

/// Result type alias for tile operations.
pub type TileResult<T> = Result<T, TileError>;
