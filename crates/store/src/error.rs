//! Store Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;

/// A store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// A value could not be converted to or from its stored form.
    #[display("invalid stored data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    #[display("change not found: {_0}")]
    ChangeNotFound(#[error(not(source))] String),
    /// Filesystem error while executing a change or reading a cover.
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// The change type is carried out by the catalog service, not locally.
    #[display("unsupported change type: {_0}")]
    Unsupported(#[error(not(source))] String),
    /// The change lacks a path its type requires.
    #[display("missing {_0} path")]
    MissingPath(#[error(not(source))] &'static str),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database | Self::Io(_))
    }
}
