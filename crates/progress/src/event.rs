use crate::bus::BusEvent;
use crate::error::{ErrorKind, Result};
use derive_more::Display;
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-item status reported in an `{operation}-progress` event.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[display("pending")]
    Pending,
    #[display("processing")]
    Processing,
    #[display("done")]
    Done,
    #[display("skipped")]
    Skipped,
    #[display("error")]
    Error,
}
impl ItemStatus {
    /// Whether an item with this status still counts as in-progress.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

/// Unified per-item progress payload shared by every background operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationProgress {
    pub item_id: String,
    pub status: ItemStatus,
    #[serde(default)]
    pub message: Option<String>,
    /// One-based position of this item within the run.
    pub current: u64,
    pub total: u64,
}
impl OperationProgress {
    pub fn new(item_id: impl Into<String>, status: ItemStatus, current: u64, total: u64) -> Self {
        Self {
            item_id: item_id.into(),
            status,
            message: None,
            current,
            total,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Final tally carried by an `{operation}-complete` event.
///
/// A cancelled run still completes; its unprocessed items are counted as
/// `skipped`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    pub total: u64,
    pub processed: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// The three event kinds an operation publishes, used as the topic suffix.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum EventKind {
    #[display("progress")]
    Progress,
    #[display("complete")]
    Complete,
    #[display("error")]
    Error,
}
impl EventKind {
    pub const ALL: [Self; 3] = [Self::Progress, Self::Complete, Self::Error];

    /// Namespaced topic for this kind, e.g. `enrich-progress`.
    pub fn topic(self, operation: &str) -> String {
        format!("{operation}-{self}")
    }

    /// Match a bus topic against an operation namespace.
    ///
    /// Returns `None` for topics belonging to other operations.
    pub fn parse_topic(operation: &str, topic: &str) -> Option<Self> {
        let suffix = topic.strip_prefix(operation)?.strip_prefix('-')?;
        Self::ALL.into_iter().find(|kind| kind.to_string() == suffix)
    }
}

/// A decoded event for one operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationEvent {
    Progress(OperationProgress),
    Complete(OperationStats),
    Error(String),
}
impl OperationEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Progress(_) => EventKind::Progress,
            Self::Complete(_) => EventKind::Complete,
            Self::Error(_) => EventKind::Error,
        }
    }

    /// Complete and error events end a run.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }

    /// Decode a raw bus event for `operation`.
    ///
    /// Returns `None` when the topic belongs to some other operation. A payload
    /// that does not match its topic is not dropped: it is turned into an
    /// [`OperationEvent::Error`] so that a misbehaving producer ends the run
    /// instead of leaving observers waiting forever.
    pub fn decode(operation: &str, event: &BusEvent) -> Option<Self> {
        let kind = EventKind::parse_topic(operation, &event.topic)?;
        match Self::parse(kind, &event.topic, &event.payload) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                let reason = format!("{}", &*err);
                tracing::warn!(topic = %event.topic, %reason, "Converting malformed event payload into an error");
                Some(Self::Error(reason))
            },
        }
    }

    /// Strictly parse a payload as the given kind.
    pub fn parse(kind: EventKind, topic: &str, payload: &Value) -> Result<Self> {
        let malformed = || ErrorKind::MalformedPayload(topic.to_string());
        match kind {
            EventKind::Progress => {
                let progress = OperationProgress::deserialize(payload).or_raise(malformed)?;
                Ok(Self::Progress(progress))
            },
            EventKind::Complete => {
                let stats = OperationStats::deserialize(payload).or_raise(malformed)?;
                Ok(Self::Complete(stats))
            },
            EventKind::Error => match payload {
                Value::String(message) => Ok(Self::Error(message.clone())),
                // Producers are supposed to send a bare string, but a reason in
                // any shape is still a reason.
                Value::Null => Ok(Self::Error(String::from("unknown error"))),
                other => Ok(Self::Error(other.to_string())),
            },
        }
    }

    /// Encode as a raw bus event under `operation`'s namespace.
    pub fn encode(&self, operation: &str) -> Result<BusEvent> {
        let topic = self.kind().topic(operation);
        let payload = match self {
            Self::Progress(progress) => serde_json::to_value(progress),
            Self::Complete(stats) => serde_json::to_value(stats),
            Self::Error(message) => Ok(Value::String(message.clone())),
        }
        .or_raise(|| ErrorKind::Encode(topic.clone()))?;
        Ok(BusEvent { topic, payload })
    }
}
