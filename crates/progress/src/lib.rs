//! Progress tracking for long-running backend operations.
//!
//! Backend jobs (scan, enrich, sync, bulk-apply) announce their work on an
//! [event bus](bus) under a per-operation namespace: `{name}-progress` for each
//! item, then exactly one `{name}-complete` or `{name}-error`. This crate
//! provides:
//!
//! - **Typed events** ([`OperationProgress`], [`OperationStats`],
//!   [`OperationEvent`]) and their JSON wire encoding.
//! - **The bus seam** ([`EventBus`]), with an in-process
//!   [`BroadcastBus`] implementation, and a [`Publisher`] for the producing
//!   side.
//! - **[`ProgressCoordinator`]**, which folds one operation's events into an
//!   observable [`OperationProgressState`].
//!
//! Cancellation is not handled here: it is a separate backend command, and the
//! coordinator only reflects the `complete` event the backend eventually sends.

pub mod bus;
mod coordinator;
pub mod error;
mod event;
mod state;

pub use crate::bus::{BroadcastBus, BusEvent, BusHandle, EventBus, Publisher};
pub use crate::coordinator::{ProgressCoordinator, Settlement};
pub use crate::event::{EventKind, ItemStatus, OperationEvent, OperationProgress, OperationStats};
pub use crate::state::OperationProgressState;
