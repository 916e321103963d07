//! In-memory backend and catalog for testing.

use crate::backend::{CatalogRefresher, ChangeBackend};
use crate::change::{ChangeId, ChangeStatus, Channel, PendingChange};
use crate::error::{ErrorKind, Result};
use crate::scope::Target;
use async_trait::async_trait;
use folio_progress::{BusHandle, ItemStatus, OperationProgress, OperationStats, Publisher};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use time::OffsetDateTime;
use tokio::sync::{RwLock, Semaphore};

/// A channel command as the mock backend received it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockCall {
    pub command: &'static str,
    /// Wire form: empty means "all pending".
    pub ids: Vec<String>,
}

/// In-memory [`ChangeBackend`].
///
/// Changes live in a `Vec` behind a [`RwLock`], so listing returns them in
/// insertion order. Applying marks each in-scope pending change `applied`,
/// unless it was set up to fail with [`fail_item()`](Self::fail_item).
/// When a bus is attached, applies publish progress under the channel's
/// operation name exactly like a real backend would.
pub struct MockChangeBackend {
    name: String,
    changes: RwLock<Vec<PendingChange>>,
    failing_items: RwLock<HashMap<ChangeId, String>>,
    failing_channels: RwLock<HashMap<Channel, String>>,
    calls: Mutex<Vec<MockCall>>,
    bus: Option<BusHandle>,
    gate: Option<Arc<Semaphore>>,
}

impl MockChangeBackend {
    pub fn with_changes(changes: impl IntoIterator<Item = PendingChange>) -> Self {
        Self {
            name: "mock".to_string(),
            changes: RwLock::new(changes.into_iter().collect()),
            failing_items: RwLock::default(),
            failing_channels: RwLock::default(),
            calls: Mutex::default(),
            bus: None,
            gate: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Publish `{operation}-progress` and `{operation}-complete` during applies.
    pub fn with_bus(mut self, bus: BusHandle) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Hold every channel command until a permit is available on `gate`.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub async fn push(&self, change: PendingChange) {
        self.changes.write().await.push(change);
    }

    pub async fn get(&self, id: &str) -> Option<PendingChange> {
        self.changes.read().await.iter().find(|change| change.id.as_str() == id).cloned()
    }

    /// Reject this change with `reason` when it is applied.
    pub async fn fail_item(&self, id: impl Into<ChangeId>, reason: impl Into<String>) {
        self.failing_items.write().await.insert(id.into(), reason.into());
    }

    /// Fail every command on `channel` outright.
    pub async fn fail_channel(&self, channel: Channel, reason: impl Into<String>) {
        self.failing_channels.write().await.insert(channel, reason.into());
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn enter(&self, command: &'static str, channel: Channel, target: &Target) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MockCall { command, ids: target.to_wire() });
        if let Some(gate) = &self.gate {
            // Closing the semaphore releases everyone.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(reason) = self.failing_channels.read().await.get(&channel) {
            exn::bail!(ErrorKind::Backend(reason.clone()));
        }
        Ok(())
    }

    fn publisher(&self, channel: Channel) -> Option<Publisher> {
        self.bus.as_ref().map(|bus| Publisher::new(bus.clone(), channel.operation()))
    }
}

impl Default for MockChangeBackend {
    fn default() -> Self {
        Self::with_changes(Vec::new())
    }
}

#[async_trait]
impl ChangeBackend for MockChangeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_changes(&self, status: Option<ChangeStatus>) -> Result<Vec<PendingChange>> {
        let changes = self.changes.read().await;
        Ok(changes.iter().filter(|change| status.is_none_or(|s| change.status == s)).cloned().collect())
    }

    async fn apply_changes(&self, channel: Channel, target: &Target) -> Result<u64> {
        self.enter(channel.apply_command(), channel, target).await?;
        let publisher = self.publisher(channel);
        let failing = self.failing_items.read().await.clone();
        let mut changes = self.changes.write().await;
        let in_scope: Vec<usize> = changes
            .iter()
            .enumerate()
            .filter(|(_, change)| change.is_pending() && change.channel() == channel && target.includes(&change.id))
            .map(|(index, _)| index)
            .collect();

        let total = in_scope.len() as u64;
        let mut stats = OperationStats { total, ..OperationStats::default() };
        for (position, index) in in_scope.into_iter().enumerate() {
            let change = &mut changes[index];
            let current = position as u64 + 1;
            let item = change.id.as_str().to_string();
            if let Some(publisher) = &publisher {
                publisher.progress(OperationProgress::new(&item, ItemStatus::Processing, current, total));
            }
            let status = match failing.get(&change.id) {
                Some(reason) => {
                    change.mark_error(reason.clone());
                    stats.errors += 1;
                    ItemStatus::Error
                },
                None => {
                    change.mark_applied(OffsetDateTime::now_utc());
                    stats.processed += 1;
                    ItemStatus::Done
                },
            };
            if let Some(publisher) = &publisher {
                publisher.progress(OperationProgress::new(&item, status, current, total));
            }
        }
        drop(changes);
        if let Some(publisher) = &publisher {
            publisher.complete(stats);
        }
        Ok(total)
    }

    async fn remove_changes(&self, channel: Channel, target: &Target) -> Result<u64> {
        self.enter(channel.remove_command(), channel, target).await?;
        let mut changes = self.changes.write().await;
        let before = changes.len();
        changes.retain(|change| !(change.is_pending() && change.channel() == channel && target.includes(&change.id)));
        Ok((before - changes.len()) as u64)
    }

    async fn fail_changes(&self, channel: Channel, target: &Target, message: &str) -> Result<u64> {
        let mut changes = self.changes.write().await;
        let mut failed = 0;
        for change in changes.iter_mut() {
            if change.is_pending() && change.channel() == channel && target.includes(&change.id) {
                change.mark_error(message);
                failed += 1;
            }
        }
        Ok(failed)
    }
}

/// Catalog that counts reloads.
#[derive(Debug, Default)]
pub struct MockCatalog {
    reloads: AtomicUsize,
    failing: AtomicBool,
}

impl MockCatalog {
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl CatalogRefresher for MockCatalog {
    async fn reload(&self) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            exn::bail!(ErrorKind::Catalog);
        }
        Ok(())
    }
}
