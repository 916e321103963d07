use crate::error::Result;
use crate::handle::{AssetBlob, AssetHandle, HandleRegistry};
use crate::resolver::{AssetKey, ResolverHandle};
use futures::StreamExt;
use futures::future::{AbortHandle, Abortable, Aborted, BoxFuture};
use futures::stream::FuturesUnordered;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Where a key is in its fetch lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    Queued,
    InFlight,
    Resolved,
    /// Resolved to nothing, or failed. Not retried until forced.
    Absent,
}

enum Entry {
    Queued { ticket: u64 },
    InFlight { ticket: u64, abort: AbortHandle },
    Resolved(AssetHandle),
    Absent,
}

impl Entry {
    fn state(&self) -> EntryState {
        match self {
            Self::Queued { .. } => EntryState::Queued,
            Self::InFlight { .. } => EntryState::InFlight,
            Self::Resolved(_) => EntryState::Resolved,
            Self::Absent => EntryState::Absent,
        }
    }
}

/// Every request is stamped with a ticket. A queued or in-flight entry whose
/// ticket no longer matches has been superseded by an eviction or a forced
/// refresh, and whatever it produces is discarded.
#[derive(Default)]
struct Table {
    entries: HashMap<AssetKey, Entry>,
    queue: VecDeque<(AssetKey, u64)>,
    next_ticket: u64,
}

impl Table {
    fn issue(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn is_current(&self, key: &AssetKey, ticket: u64, state: EntryState) -> bool {
        match self.entries.get(key) {
            Some(Entry::Queued { ticket: current }) => state == EntryState::Queued && *current == ticket,
            Some(Entry::InFlight { ticket: current, .. }) => state == EntryState::InFlight && *current == ticket,
            _ => false,
        }
    }

    fn prune_queue(&mut self) {
        let Self { entries, queue, .. } = self;
        queue.retain(|(key, ticket)| matches!(entries.get(key), Some(Entry::Queued { ticket: current }) if current == ticket));
    }

    /// Drop an entry, releasing whatever it holds. Returns whether it held a handle.
    fn discard(&mut self, key: &str, registry: &HandleRegistry) -> bool {
        match self.entries.remove(key) {
            Some(Entry::Resolved(handle)) => registry.release(&handle),
            Some(Entry::InFlight { abort, .. }) => {
                abort.abort();
                false
            },
            Some(Entry::Queued { .. } | Entry::Absent) | None => false,
        }
    }

    fn is_busy(&self) -> bool {
        self.entries.values().any(|entry| matches!(entry, Entry::Queued { .. } | Entry::InFlight { .. }))
    }

    fn teardown(&mut self, registry: &HandleRegistry) {
        for (_, entry) in self.entries.drain() {
            match entry {
                Entry::Resolved(handle) => {
                    registry.release(&handle);
                },
                Entry::InFlight { abort, .. } => abort.abort(),
                Entry::Queued { .. } | Entry::Absent => {},
            }
        }
        self.queue.clear();
    }
}

type FetchOutcome = (AssetKey, u64, std::result::Result<Result<Option<AssetBlob>>, Aborted>);

struct Shared {
    table: Mutex<Table>,
    resolver: ResolverHandle,
    registry: Arc<HandleRegistry>,
    max_concurrent: usize,
    wake: Notify,
    /// Signalled whenever an entry leaves the queued or in-flight state.
    settled: Notify,
    shutdown: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start queued fetches until every slot is taken.
    ///
    /// The slot count is the number of futures still in `fetches`, aborted ones
    /// included, so a cancelled fetch keeps its slot until it has unwound.
    /// `busy` holds the keys of those futures; a key is never fetched twice at
    /// once, so a re-queued key waits for its previous fetch to unwind first.
    fn fill(&self, fetches: &mut FuturesUnordered<BoxFuture<'static, FetchOutcome>>, busy: &mut HashSet<AssetKey>) {
        let mut table = self.lock();
        let mut deferred = Vec::new();
        while fetches.len() < self.max_concurrent {
            let Some((key, ticket)) = table.queue.pop_front() else {
                break;
            };
            if !table.is_current(&key, ticket, EntryState::Queued) {
                continue;
            }
            if busy.contains(&key) {
                deferred.push((key, ticket));
                continue;
            }
            let (abort, registration) = AbortHandle::new_pair();
            table.entries.insert(key.clone(), Entry::InFlight { ticket, abort });
            busy.insert(key.clone());
            tracing::trace!(%key, in_flight = fetches.len() + 1, "Fetching asset");
            let resolver = self.resolver.clone();
            fetches.push(Box::pin(async move {
                let outcome = Abortable::new(resolver.resolve(&key), registration).await;
                (key, ticket, outcome)
            }));
        }
        for item in deferred.into_iter().rev() {
            table.queue.push_front(item);
        }
    }

    fn settle(&self, (key, ticket, outcome): FetchOutcome) {
        let mut table = self.lock();
        if !table.is_current(&key, ticket, EntryState::InFlight) {
            tracing::trace!(%key, "Discarding superseded asset fetch");
            return;
        }
        let entry = match outcome {
            Ok(Ok(Some(blob))) => Entry::Resolved(self.registry.acquire(blob)),
            Ok(Ok(None)) => {
                tracing::debug!(%key, "Asset does not exist");
                Entry::Absent
            },
            Ok(Err(err)) => {
                tracing::debug!(%key, error = ?err, "Asset fetch failed; leaving absent");
                Entry::Absent
            },
            Err(Aborted) => Entry::Absent,
        };
        table.entries.insert(key, entry);
        drop(table);
        self.settled.notify_waiters();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let table = self.table.get_mut().unwrap_or_else(PoisonError::into_inner);
        table.teardown(&self.registry);
    }
}

async fn drive(shared: Arc<Shared>) {
    let mut fetches = FuturesUnordered::new();
    let mut busy = HashSet::new();
    loop {
        shared.fill(&mut fetches, &mut busy);
        tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break,
            Some(outcome) = fetches.next(), if !fetches.is_empty() => {
                busy.remove(&outcome.0);
                shared.settle(outcome);
            },
            () = shared.wake.notified() => {},
        }
    }
    tracing::debug!(abandoned = fetches.len(), "Asset cache driver stopped");
}

/// Bounded-concurrency cache of resolved assets.
///
/// Requests are served in the order they are made, with forced refreshes
/// jumping the queue. Each key has at most one fetch in flight and at most one
/// live handle. Must be created inside a Tokio runtime.
pub struct AssetCache {
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl AssetCache {
    /// Spawn the fetch driver. `max_concurrent` is clamped to at least one.
    pub fn spawn(resolver: ResolverHandle, max_concurrent: usize) -> Self {
        let shared = Arc::new(Shared {
            table: Mutex::new(Table::default()),
            resolver,
            registry: Arc::new(HandleRegistry::default()),
            max_concurrent: max_concurrent.max(1),
            wake: Notify::new(),
            settled: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        let driver = tokio::spawn(drive(shared.clone()));
        Self { shared, driver: Mutex::new(Some(driver)) }
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.max_concurrent
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.shared.registry
    }

    /// Queue every key not already tracked, in the order given.
    ///
    /// Keys that are queued, in flight, resolved or absent are left alone, so
    /// calling this repeatedly as the viewport scrolls is cheap and never
    /// causes duplicate fetches.
    pub fn request_visible<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<AssetKey>,
    {
        let mut table = self.shared.lock();
        let mut queued = 0usize;
        for key in keys {
            let key = key.into();
            if table.entries.contains_key(&key) {
                continue;
            }
            let ticket = table.issue();
            table.entries.insert(key.clone(), Entry::Queued { ticket });
            table.queue.push_back((key, ticket));
            queued += 1;
        }
        drop(table);
        if queued > 0 {
            tracing::trace!(queued, "Queued visible assets");
            self.shared.wake.notify_one();
        }
    }

    /// Discard whatever is known about `key` and fetch it again ahead of
    /// everything else queued.
    pub fn force_refresh(&self, key: impl Into<AssetKey>) {
        let key = key.into();
        let mut table = self.shared.lock();
        table.discard(key.as_str(), &self.shared.registry);
        let ticket = table.issue();
        table.entries.insert(key.clone(), Entry::Queued { ticket });
        table.prune_queue();
        table.queue.push_front((key, ticket));
        drop(table);
        self.shared.wake.notify_one();
    }

    /// Forget the given keys, releasing their handles and cancelling their fetches.
    pub fn evict<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut table = self.shared.lock();
        let mut released = 0usize;
        for key in keys {
            if table.discard(key.as_ref(), &self.shared.registry) {
                released += 1;
            }
        }
        table.prune_queue();
        drop(table);
        self.shared.settled.notify_waiters();
        tracing::trace!(released, "Evicted assets");
    }

    /// Evict every key that is not in `relevant`, typically the ids of the
    /// currently loaded catalog items.
    pub fn retain_relevant<I, K>(&self, relevant: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<AssetKey>,
    {
        let relevant: HashSet<AssetKey> = relevant.into_iter().map(Into::into).collect();
        let stale: Vec<AssetKey> = {
            let table = self.shared.lock();
            table.entries.keys().filter(|key| !relevant.contains(*key)).cloned().collect()
        };
        if !stale.is_empty() {
            self.evict(stale);
        }
    }

    /// The live handle for `key`, if it has resolved.
    pub fn get(&self, key: &str) -> Option<AssetHandle> {
        match self.shared.lock().entries.get(key) {
            Some(Entry::Resolved(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn state(&self, key: &str) -> Option<EntryState> {
        self.shared.lock().entries.get(key).map(Entry::state)
    }

    /// Wait until no key is queued or in flight, or the cache shuts down.
    pub async fn idle(&self) {
        loop {
            let notified = self.shared.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.shutdown.is_cancelled() || !self.shared.lock().is_busy() {
                return;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the driver, cancel outstanding fetches and release every handle.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(driver) = driver
            && let Err(err) = driver.await
        {
            tracing::warn!(error = %err, "Asset cache driver did not stop cleanly");
        }
        self.shared.lock().teardown(&self.shared.registry);
        self.shared.settled.notify_waiters();
        tracing::debug!(
            acquired = self.shared.registry.acquired(),
            released = self.shared.registry.released(),
            "Asset cache shut down"
        );
    }
}

impl Drop for AssetCache {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl std::fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetCache")
            .field("max_concurrent", &self.shared.max_concurrent)
            .field("entries", &self.len())
            .field("live_handles", &self.shared.registry.live())
            .finish()
    }
}
