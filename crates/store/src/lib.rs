//! SQLite reference backend for staged changes and cover images.
//!
//! - [`ChangeRepository`] persists [`PendingChange`](folio_ledger::PendingChange)s.
//!   Only pending rows are ever re-marked or deleted, so settled changes stay
//!   as history.
//! - [`SqliteChangeBackend`] implements the ledger's
//!   [`ChangeBackend`](folio_ledger::ChangeBackend) on top of it, running each
//!   change through a [`ChangeExecutor`] and reporting progress on the bus.
//! - [`CoverStore`] records cover files per item and resolves them for the
//!   asset cache.

mod backend;
mod covers;
mod db;
pub mod error;
mod executor;
mod models;
mod repo;

pub use crate::backend::SqliteChangeBackend;
pub use crate::covers::CoverStore;
pub use crate::db::Database;
pub use crate::executor::{ChangeExecutor, ExecutorHandle, LocalExecutor};
pub use crate::repo::ChangeRepository;
