//! Progress Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A progress error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for progress operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// An event could not be serialized for the bus.
    #[display("could not encode event for topic: {_0}")]
    Encode(#[error(not(source))] String),
    /// An event arrived on the bus but its payload did not match the topic.
    #[display("malformed payload on topic: {_0}")]
    MalformedPayload(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
