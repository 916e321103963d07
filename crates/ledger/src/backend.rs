//! Seams to the external command service and catalog view.

use crate::change::{ChangeStatus, Channel, PendingChange};
use crate::error::Result;
use crate::scope::Target;
use async_trait::async_trait;
use std::sync::Arc;

pub type BackendHandle = Arc<dyn ChangeBackend>;
pub type CatalogHandle = Arc<dyn CatalogRefresher>;

/// The backend command service that stores and executes pending changes.
///
/// Per-item failures are recorded on the change itself (status `error` and a
/// message) and do not fail the command. An `Err` means the command as a
/// whole did not run, and the ledger follows up with
/// [`fail_changes()`](Self::fail_changes).
#[async_trait]
pub trait ChangeBackend: Send + Sync {
    /// Name of the backend, for logging only.
    fn name(&self) -> &str;

    /// Changes with the given status (or all of them), oldest first.
    async fn list_changes(&self, status: Option<ChangeStatus>) -> Result<Vec<PendingChange>>;

    /// Apply the pending changes of `channel` selected by `target`. Returns the
    /// number of changes attempted.
    async fn apply_changes(&self, channel: Channel, target: &Target) -> Result<u64>;

    /// Discard pending changes of `channel` selected by `target`. Changes that
    /// are no longer pending are left untouched. Returns the number removed.
    async fn remove_changes(&self, channel: Channel, target: &Target) -> Result<u64>;

    /// Record `message` as the error of every pending change of `channel`
    /// selected by `target`. Returns the number of changes marked.
    async fn fail_changes(&self, channel: Channel, target: &Target, message: &str) -> Result<u64>;
}

/// The catalog view's single "reload everything" operation. Idempotent.
#[async_trait]
pub trait CatalogRefresher: Send + Sync {
    async fn reload(&self) -> Result<()>;
}
