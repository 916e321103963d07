use crate::event::{OperationEvent, OperationProgress, OperationStats};
use std::collections::BTreeSet;

/// Aggregate view of one named background operation.
///
/// Only ever mutated by events for its own operation, and reset to
/// [`Default`] when the operation completes or fails. Never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperationProgressState {
    pub running: bool,
    /// The most recently received progress record.
    pub snapshot: Option<OperationProgress>,
    /// Items currently `pending` or `processing`.
    pub active_ids: BTreeSet<String>,
}

impl OperationProgressState {
    pub fn is_idle(&self) -> bool {
        !self.running && self.snapshot.is_none() && self.active_ids.is_empty()
    }

    fn record(&mut self, progress: OperationProgress) {
        self.running = true;
        if progress.status.is_active() {
            self.active_ids.insert(progress.item_id.clone());
        } else {
            self.active_ids.remove(&progress.item_id);
        }
        self.snapshot = Some(progress);
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// What folding a single event did.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Fold {
    Updated,
    /// A progress event arrived after the run had already settled.
    Stale,
    Completed(OperationStats),
    Failed(String),
}

/// Folds one run's events into an [`OperationProgressState`].
///
/// One tracker covers one run: once a terminal event has been folded every
/// further progress event is stale. Terminal events always apply.
#[derive(Debug, Default)]
pub(crate) struct Tracker {
    settled: bool,
}

impl Tracker {
    pub(crate) fn fold(&mut self, state: &mut OperationProgressState, event: OperationEvent) -> Fold {
        if event.is_terminal() {
            self.settled = true;
            state.clear();
        } else if self.settled {
            return Fold::Stale;
        }
        match event {
            OperationEvent::Progress(progress) => {
                state.record(progress);
                Fold::Updated
            },
            OperationEvent::Complete(stats) => Fold::Completed(stats),
            OperationEvent::Error(reason) => Fold::Failed(reason),
        }
    }
}
