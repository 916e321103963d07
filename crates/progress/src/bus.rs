//! Event bus seam between backend producers and progress observers.
//!
//! The bus carries raw [`BusEvent`]s (a topic plus a JSON payload), the same
//! shape a desktop shell's IPC layer would deliver. Typed encoding and decoding
//! happens at the edges: [`Publisher`] on the producing side and
//! [`ProgressCoordinator`](crate::ProgressCoordinator) on the observing side.

use crate::event::{OperationEvent, OperationProgress, OperationStats};
use async_stream::stream;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

pub type BusStream = Pin<Box<dyn Stream<Item = BusEvent> + Send + 'static>>;
pub type BusHandle = Arc<dyn EventBus>;

/// A raw notification as published by the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    pub topic: String,
    pub payload: Value,
}

/// Publish/subscribe interface to the backend's event bus.
///
/// Subscriptions must be registered by the time [`subscribe()`](Self::subscribe)
/// returns (not when the stream is first polled), otherwise events published
/// between subscribing and polling would be lost. Events are delivered to each
/// subscriber in publication order.
pub trait EventBus: Send + Sync {
    /// Publish an event to every current subscriber. Never blocks; publishing
    /// with no subscribers is not an error.
    fn publish(&self, event: BusEvent);

    /// Subscribe to every event published from now on. The stream ends when
    /// the bus shuts down.
    fn subscribe(&self) -> BusStream;
}

/// In-process [`EventBus`] backed by a Tokio broadcast channel.
///
/// A subscriber that falls more than `capacity` events behind skips the
/// oldest ones (with a warning) rather than stalling the publisher.
#[derive(Debug)]
pub struct BroadcastBus {
    sender: broadcast::Sender<BusEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        // Zero capacity panics inside Tokio.
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Number of live subscriptions.
    pub fn subscribers(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, event: BusEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            tracing::trace!(topic = %event.topic, "Published event with no subscribers");
        }
    }

    fn subscribe(&self) -> BusStream {
        let mut receiver = self.sender.subscribe();
        Box::pin(stream!({
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        yield event;
                    },
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Event bus subscriber lagged; oldest events dropped");
                    },
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }
}

/// Producer-side helper bound to one operation namespace.
#[derive(Clone)]
pub struct Publisher {
    bus: BusHandle,
    operation: String,
}

impl Publisher {
    pub fn new(bus: BusHandle, operation: impl Into<String>) -> Self {
        Self { bus, operation: operation.into() }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn progress(&self, progress: OperationProgress) {
        self.emit(OperationEvent::Progress(progress));
    }

    pub fn complete(&self, stats: OperationStats) {
        self.emit(OperationEvent::Complete(stats));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(OperationEvent::Error(message.into()));
    }

    fn emit(&self, event: OperationEvent) {
        match event.encode(&self.operation) {
            Ok(raw) => self.bus.publish(raw),
            Err(err) => tracing::warn!(operation = %self.operation, error = ?err, "Dropping unencodable event"),
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").field("operation", &self.operation).finish_non_exhaustive()
    }
}
