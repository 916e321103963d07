//! Asset Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// An asset error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for asset operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why an asset could not be resolved.
///
/// The cache itself never surfaces these to callers: a failed fetch simply
/// leaves the key [`Absent`](crate::EntryState::Absent).
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The resolver's backing store failed (database, filesystem, network).
    #[display("asset resolution failed")]
    Resolve,
    /// The asset exists but cannot be read.
    #[display("asset unavailable: {_0}")]
    Unavailable(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Resolve)
    }
}
