//! Ledger Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use crate::change::Channel;
use derive_more::{Display, Error};

/// A ledger error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// Per-item and per-channel failures during apply are reported in a
/// [`BatchReport`](crate::BatchReport), not through this type.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The backend command service failed or rejected the command outright.
    #[display("backend error: {_0}")]
    Backend(#[error(not(source))] String),
    /// Listing changes from the backend failed.
    #[display("backend listing failed")]
    Listing,
    /// Reloading the catalog failed.
    #[display("catalog refresh failed")]
    Catalog,
    /// The scope contains a destructive change and was not confirmed.
    #[display("scope contains {_0} destructive change(s); confirmation required")]
    ConfirmationRequired(#[error(not(source))] usize),
    /// Another apply or remove is already working on part of this scope.
    #[display("{_0} channel is busy with an overlapping apply or remove")]
    Busy(#[error(not(source))] Channel),
    #[display("unknown change type: {_0}")]
    UnknownChangeType(#[error(not(source))] String),
    #[display("unknown change status: {_0}")]
    UnknownStatus(#[error(not(source))] String),
    #[display("unknown channel: {_0}")]
    UnknownChannel(#[error(not(source))] String),
    #[display("unknown refresh policy: {_0}")]
    UnknownRefreshPolicy(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Listing | Self::Catalog | Self::Busy(_))
    }
}
