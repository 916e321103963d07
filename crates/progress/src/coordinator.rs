use crate::bus::{BusHandle, BusStream};
use crate::event::{OperationEvent, OperationStats};
use crate::state::{Fold, OperationProgressState, Tracker};
use futures::StreamExt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

type CompleteCallback = Arc<dyn Fn(&OperationStats) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// How an observed run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    Completed(OperationStats),
    Failed(String),
}

/// Observes one named backend operation and exposes its aggregate state.
///
/// Nothing is observed until [`start()`](Self::start) subscribes to the bus.
/// The subscription lives until the run settles (a `complete` or `error`
/// event), [`stop()`](Self::stop) is called, or the coordinator is dropped.
/// Unsubscribing at the terminal event is what keeps late `progress` events
/// from the same run from flipping [`running`](OperationProgressState::running)
/// back on; to observe the next run, call `start()` again.
///
/// A disabled coordinator (e.g. when no backend runtime is attached) accepts
/// every call and does nothing.
///
/// ```no_run
/// use folio_progress::{BroadcastBus, BusHandle, ProgressCoordinator};
/// use std::sync::Arc;
///
/// # async fn example() {
/// let bus: BusHandle = Arc::new(BroadcastBus::new(64));
/// let enrich = ProgressCoordinator::new("enrich", true, bus)
///     .on_complete(|stats| println!("enriched {} of {}", stats.processed, stats.total))
///     .on_error(|reason| eprintln!("enrichment failed: {reason}"));
/// enrich.start();
/// let mut state = enrich.watch();
/// while state.changed().await.is_ok() {
///     println!("{:?}", state.borrow().snapshot);
/// }
/// # }
/// ```
pub struct ProgressCoordinator {
    operation: String,
    enabled: bool,
    bus: BusHandle,
    state: Arc<watch::Sender<OperationProgressState>>,
    settlement: Arc<watch::Sender<Option<Settlement>>>,
    on_complete: Option<CompleteCallback>,
    on_error: Option<ErrorCallback>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressCoordinator {
    pub fn new(operation: impl Into<String>, enabled: bool, bus: BusHandle) -> Self {
        Self {
            operation: operation.into(),
            enabled,
            bus,
            state: Arc::new(watch::Sender::new(OperationProgressState::default())),
            settlement: Arc::new(watch::Sender::new(None)),
            on_complete: None,
            on_error: None,
            task: Mutex::new(None),
        }
    }

    /// Register the callback invoked with the final stats of a completed run.
    pub fn on_complete(mut self, callback: impl Fn(&OperationStats) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    /// Register the callback invoked with the reason a run failed.
    pub fn on_error(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether a subscription is currently live.
    pub fn is_listening(&self) -> bool {
        self.task.lock().unwrap_or_else(PoisonError::into_inner).as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Subscribe to the operation's events.
    ///
    /// Calling this while already listening is a no-op. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self) {
        if !self.enabled {
            tracing::debug!(operation = %self.operation, "Progress coordinator disabled; not subscribing");
            return;
        }
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|running| !running.is_finished()) {
            return;
        }
        // Subscribe synchronously so nothing published after start() returns is missed.
        let events = self.bus.subscribe();
        self.settlement.send_replace(None);
        let observer = Observer {
            operation: self.operation.clone(),
            state: self.state.clone(),
            settlement: self.settlement.clone(),
            on_complete: self.on_complete.clone(),
            on_error: self.on_error.clone(),
        };
        tracing::debug!(operation = %self.operation, "Subscribed to operation events");
        *task = Some(tokio::spawn(observer.run(events)));
    }

    /// Unsubscribe (if listening) and reset the state.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
            tracing::debug!(operation = %self.operation, "Unsubscribed from operation events");
        }
        self.reset();
    }

    /// Force the state back to empty without waiting for an event.
    pub fn reset(&self) {
        self.state.send_if_modified(|state| {
            let modified = !state.is_idle();
            *state = OperationProgressState::default();
            modified
        });
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> OperationProgressState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn watch(&self) -> watch::Receiver<OperationProgressState> {
        self.state.subscribe()
    }

    /// Receiver holding how the most recent run ended, or `None` while a run is
    /// being observed (or none has been yet).
    pub fn settlement(&self) -> watch::Receiver<Option<Settlement>> {
        self.settlement.subscribe()
    }
}

impl Drop for ProgressCoordinator {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ProgressCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressCoordinator")
            .field("operation", &self.operation)
            .field("enabled", &self.enabled)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

/// The subscription side of a coordinator, moved into the spawned task.
struct Observer {
    operation: String,
    state: Arc<watch::Sender<OperationProgressState>>,
    settlement: Arc<watch::Sender<Option<Settlement>>>,
    on_complete: Option<CompleteCallback>,
    on_error: Option<ErrorCallback>,
}

impl Observer {
    async fn run(self, mut events: BusStream) {
        let mut tracker = Tracker::default();
        while let Some(raw) = events.next().await {
            let Some(event) = OperationEvent::decode(&self.operation, &raw) else {
                continue;
            };
            if self.fold(&mut tracker, event) {
                // Dropping the stream here unsubscribes before any later event is seen.
                return;
            }
        }
        tracing::warn!(operation = %self.operation, "Event bus closed before the operation settled");
        self.fold(&mut tracker, OperationEvent::Error(String::from("event bus closed")));
    }

    /// Returns `true` once the run has settled.
    fn fold(&self, tracker: &mut Tracker, event: OperationEvent) -> bool {
        let mut fold = Fold::Stale;
        self.state.send_if_modified(|state| {
            fold = tracker.fold(state, event);
            fold != Fold::Stale
        });
        match fold {
            Fold::Updated => false,
            Fold::Stale => {
                tracing::trace!(operation = %self.operation, "Ignoring progress for a settled run");
                false
            },
            Fold::Completed(stats) => {
                tracing::debug!(operation = %self.operation, ?stats, "Operation complete");
                self.settlement.send_replace(Some(Settlement::Completed(stats)));
                if let Some(callback) = &self.on_complete {
                    callback(&stats);
                }
                true
            },
            Fold::Failed(reason) => {
                tracing::debug!(operation = %self.operation, %reason, "Operation failed");
                if let Some(callback) = &self.on_error {
                    callback(&reason);
                }
                self.settlement.send_replace(Some(Settlement::Failed(reason)));
                true
            },
        }
    }
}
