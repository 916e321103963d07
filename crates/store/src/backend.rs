use crate::executor::ExecutorHandle;
use crate::repo::ChangeRepository;
use async_trait::async_trait;
use exn::ResultExt;
use folio_ledger::error::{ErrorKind as LedgerErrorKind, Result as LedgerResult};
use folio_ledger::{ChangeBackend, ChangeStatus, Channel, PendingChange, Target};
use folio_progress::{BusHandle, ItemStatus, OperationProgress, OperationStats, Publisher};
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;

/// [`ChangeBackend`] over a [`ChangeRepository`], executing changes locally.
///
/// Applying walks the channel's in-scope pending changes oldest first. Each
/// change is executed and settled on its own: a failure is recorded on that
/// change and the walk continues. With a bus attached, every item publishes
/// `{operation}-progress` before and after it runs, and the walk ends with a
/// single `{operation}-complete` carrying the stats.
pub struct SqliteChangeBackend {
    name: String,
    repo: ChangeRepository,
    executor: ExecutorHandle,
    bus: Option<BusHandle>,
    cancelled: AtomicBool,
}

impl SqliteChangeBackend {
    pub fn new(repo: ChangeRepository, executor: ExecutorHandle) -> Self {
        Self { name: "sqlite".to_string(), repo, executor, bus: None, cancelled: AtomicBool::new(false) }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_bus(mut self, bus: BusHandle) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn repository(&self) -> &ChangeRepository {
        &self.repo
    }

    /// Stop the apply in progress after its current item.
    ///
    /// Items not yet started stay pending and are reported as skipped. Has no
    /// effect on an apply that starts later.
    pub fn cancel(&self) {
        tracing::info!(backend = %self.name, "Cancelling apply");
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn publisher(&self, channel: Channel) -> Option<Publisher> {
        self.bus.as_ref().map(|bus| Publisher::new(bus.clone(), channel.operation()))
    }

    /// Execute one change and record the outcome. Returns the failure message,
    /// if any.
    async fn settle(&self, change: &PendingChange) -> LedgerResult<Option<String>> {
        let id = change.id.as_str();
        match self.executor.execute(change).await {
            Ok(()) => {
                self.repo
                    .mark_applied(id, OffsetDateTime::now_utc())
                    .await
                    .or_raise(|| LedgerErrorKind::Backend(format!("could not record {id} as applied")))?;
                Ok(None)
            },
            Err(err) => {
                let message = (*err).to_string();
                tracing::warn!(id, error = ?err, "Change failed");
                self.repo
                    .mark_error(id, &message)
                    .await
                    .or_raise(|| LedgerErrorKind::Backend(format!("could not record failure of {id}")))?;
                Ok(Some(message))
            },
        }
    }
}

#[async_trait]
impl ChangeBackend for SqliteChangeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_changes(&self, status: Option<ChangeStatus>) -> LedgerResult<Vec<PendingChange>> {
        self.repo.list(status).await.or_raise(|| LedgerErrorKind::Backend("could not list changes".to_string()))
    }

    #[tracing::instrument(skip_all, fields(backend = %self.name, %channel))]
    async fn apply_changes(&self, channel: Channel, target: &Target) -> LedgerResult<u64> {
        self.cancelled.store(false, Ordering::SeqCst);
        let changes = self
            .repo
            .pending_in_scope(channel, target)
            .await
            .or_raise(|| LedgerErrorKind::Backend("could not load changes to apply".to_string()))?;
        let publisher = self.publisher(channel);
        let total = changes.len() as u64;
        let mut stats = OperationStats { total, ..OperationStats::default() };

        for (position, change) in changes.iter().enumerate() {
            if self.cancelled.load(Ordering::SeqCst) {
                stats.skipped = total - position as u64;
                tracing::info!(skipped = stats.skipped, "Apply cancelled");
                break;
            }
            let current = position as u64 + 1;
            let item = change.id.as_str();
            if let Some(publisher) = &publisher {
                let mut progress = OperationProgress::new(item, ItemStatus::Processing, current, total);
                if let Some(path) = &change.from_path {
                    progress = progress.with_message(path.display().to_string());
                }
                publisher.progress(progress);
            }
            let failure = match self.settle(change).await {
                Ok(failure) => failure,
                Err(err) => {
                    if let Some(publisher) = &publisher {
                        publisher.error((*err).to_string());
                    }
                    return Err(err);
                },
            };
            let progress = match failure {
                Some(message) => {
                    stats.errors += 1;
                    OperationProgress::new(item, ItemStatus::Error, current, total).with_message(message)
                },
                None => {
                    stats.processed += 1;
                    OperationProgress::new(item, ItemStatus::Done, current, total)
                },
            };
            if let Some(publisher) = &publisher {
                publisher.progress(progress);
            }
        }

        tracing::info!(
            total = stats.total,
            processed = stats.processed,
            skipped = stats.skipped,
            errors = stats.errors,
            "Apply finished"
        );
        if let Some(publisher) = &publisher {
            publisher.complete(stats);
        }
        Ok(total)
    }

    #[tracing::instrument(skip_all, fields(backend = %self.name, %channel))]
    async fn remove_changes(&self, channel: Channel, target: &Target) -> LedgerResult<u64> {
        let removed = self
            .repo
            .delete_pending(channel, target)
            .await
            .or_raise(|| LedgerErrorKind::Backend("could not remove changes".to_string()))?;
        tracing::debug!(removed, "Removed pending changes");
        Ok(removed)
    }

    #[tracing::instrument(skip_all, fields(backend = %self.name, %channel))]
    async fn fail_changes(&self, channel: Channel, target: &Target, message: &str) -> LedgerResult<u64> {
        let failed = self
            .repo
            .fail_pending(channel, target, message)
            .await
            .or_raise(|| LedgerErrorKind::Backend("could not record channel failure".to_string()))?;
        tracing::warn!(failed, reason = message, "Marked pending changes as failed");
        Ok(failed)
    }
}
