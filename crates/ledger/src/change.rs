use crate::error::{Error, ErrorKind};
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use time::OffsetDateTime;

/// One of the two backend command families a change is applied through.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Library-record and file operations.
    #[display("file")]
    File,
    /// eReader sync operations.
    #[display("device")]
    Device,
}
impl Channel {
    pub const ALL: [Self; 2] = [Self::File, Self::Device];

    pub fn apply_command(self) -> &'static str {
        match self {
            Self::File => "apply-file-changes",
            Self::Device => "apply-device-changes",
        }
    }

    pub fn remove_command(self) -> &'static str {
        match self {
            Self::File => "remove-file-changes",
            Self::Device => "remove-device-changes",
        }
    }

    /// Operation namespace the backend reports this channel's progress under.
    pub fn operation(self) -> &'static str {
        match self {
            Self::File => "change",
            Self::Device => "sync",
        }
    }
}
impl FromStr for Channel {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(Self::File),
            "device" => Ok(Self::Device),
            _ => exn::bail!(ErrorKind::UnknownChannel(s.to_string())),
        }
    }
}

/// Closed set of mutations the backend knows how to perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Rename,
    Delete,
    #[serde(alias = "epub_meta")]
    MetadataUpdate,
    CoverUpdate,
    TagAdd,
    TagRemove,
    RelinkMissing,
    DeactivateMissing,
    DeviceAdd,
    DeviceRemove,
    DeviceImport,
    DeviceUpdate,
}
impl ChangeType {
    pub const ALL: [Self; 12] = [
        Self::Rename,
        Self::Delete,
        Self::MetadataUpdate,
        Self::CoverUpdate,
        Self::TagAdd,
        Self::TagRemove,
        Self::RelinkMissing,
        Self::DeactivateMissing,
        Self::DeviceAdd,
        Self::DeviceRemove,
        Self::DeviceImport,
        Self::DeviceUpdate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rename => "rename",
            Self::Delete => "delete",
            Self::MetadataUpdate => "metadata_update",
            Self::CoverUpdate => "cover_update",
            Self::TagAdd => "tag_add",
            Self::TagRemove => "tag_remove",
            Self::RelinkMissing => "relink_missing",
            Self::DeactivateMissing => "deactivate_missing",
            Self::DeviceAdd => "device_add",
            Self::DeviceRemove => "device_remove",
            Self::DeviceImport => "device_import",
            Self::DeviceUpdate => "device_update",
        }
    }

    pub fn channel(self) -> Channel {
        match self {
            Self::Rename
            | Self::Delete
            | Self::MetadataUpdate
            | Self::CoverUpdate
            | Self::TagAdd
            | Self::TagRemove
            | Self::RelinkMissing
            | Self::DeactivateMissing => Channel::File,
            Self::DeviceAdd | Self::DeviceRemove | Self::DeviceImport | Self::DeviceUpdate => Channel::Device,
        }
    }

    /// Changes that destroy data and need explicit confirmation in bulk.
    pub fn is_destructive(self) -> bool {
        matches!(self, Self::Delete)
    }
}
impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
impl FromStr for ChangeType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "epub_meta" {
            return Ok(Self::MetadataUpdate);
        }
        match Self::ALL.into_iter().find(|kind| kind.as_str() == s) {
            Some(kind) => Ok(kind),
            None => exn::bail!(ErrorKind::UnknownChangeType(s.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    #[display("pending")]
    Pending,
    #[display("applied")]
    Applied,
    #[display("error")]
    Error,
}
impl FromStr for ChangeStatus {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "applied" => Ok(Self::Applied),
            "error" => Ok(Self::Error),
            _ => exn::bail!(ErrorKind::UnknownStatus(s.to_string())),
        }
    }
}

/// Identifier of a pending change, a UUID v4 string assigned at creation.
#[derive(Clone, Debug, Display, From, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(String);
impl ChangeId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl From<&str> for ChangeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A proposed mutation, staged until the user applies or discards it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub id: ChangeId,
    /// The affected library record. Absent for device-only actions.
    #[serde(default)]
    pub target_id: Option<String>,
    pub change_type: ChangeType,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub from_path: Option<PathBuf>,
    #[serde(default)]
    pub to_path: Option<PathBuf>,
    #[serde(default)]
    pub payload: Value,
    pub status: ChangeStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub applied_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub error: Option<String>,
}
impl PendingChange {
    /// A fresh `pending` change with a newly generated id.
    pub fn new(change_type: ChangeType) -> Self {
        Self {
            id: ChangeId::generate(),
            target_id: None,
            change_type,
            device_id: None,
            from_path: None,
            to_path: None,
            payload: Value::Null,
            status: ChangeStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
            applied_at: None,
            error: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<ChangeId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_paths(mut self, from: Option<PathBuf>, to: Option<PathBuf>) -> Self {
        self.from_path = from;
        self.to_path = to;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn channel(&self) -> Channel {
        self.change_type.channel()
    }

    pub fn is_pending(&self) -> bool {
        self.status == ChangeStatus::Pending
    }

    /// Transition to `applied`. Terminal states are never left.
    pub fn mark_applied(&mut self, at: OffsetDateTime) {
        if self.is_pending() {
            self.status = ChangeStatus::Applied;
            self.applied_at = Some(at);
            self.error = None;
        }
    }

    /// Transition to `error`. Terminal states are never left.
    pub fn mark_error(&mut self, message: impl Into<String>) {
        if self.is_pending() {
            self.status = ChangeStatus::Error;
            self.error = Some(message.into());
        }
    }
}

/// Pure lookup of the channel a change type is applied through.
pub fn classify(change_type: ChangeType) -> Channel {
    change_type.channel()
}
