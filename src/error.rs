//! CLI Error Types

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("configuration error")]
    Config,
    #[display("could not open the change store")]
    Store,
    #[display("ledger command failed")]
    Ledger,
    #[display("could not write output")]
    Output,
    /// Arguments parsed but do not make sense together.
    #[display("invalid arguments: {_0}")]
    InvalidArgument(#[error(not(source))] String),
}
