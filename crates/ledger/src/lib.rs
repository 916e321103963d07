//! The staged mutation ledger.
//!
//! Edits to the library are not performed directly: they are proposed as
//! [`PendingChange`]s, reviewed, and then applied or discarded in batches.
//! Each change belongs to one of two [`Channel`]s (library-record changes and
//! eReader sync changes), and the backend exposes a separate apply and remove
//! command per channel. The [`Ledger`] splits every batch by channel, issues
//! the commands concurrently, and decides whether the catalog view needs a
//! reload afterwards.

mod backend;
mod change;
pub mod error;
mod ledger;
#[cfg(any(test, feature = "mock"))]
mod mock;
mod scope;

pub use crate::backend::{BackendHandle, CatalogHandle, CatalogRefresher, ChangeBackend};
pub use crate::change::{ChangeId, ChangeStatus, ChangeType, Channel, PendingChange, classify};
pub use crate::ledger::{BatchOptions, BatchReport, ChannelOutcome, Ledger, RefreshOutcome, RefreshPolicy};
#[cfg(any(test, feature = "mock"))]
pub use crate::mock::{MockCall, MockCatalog, MockChangeBackend};
pub use crate::scope::{ChangeFilter, Scope, Target, contains_destructive};
