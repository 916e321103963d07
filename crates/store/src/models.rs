use crate::error::{Error, ErrorKind};
use exn::{OptionExt, ResultExt};
use folio_ledger::{ChangeId, ChangeStatus, ChangeType, PendingChange};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ChangeRow {
    pub(crate) id: String,
    pub(crate) target_id: Option<String>,
    pub(crate) change_type: String,
    pub(crate) device_id: Option<String>,
    pub(crate) from_path: Option<String>,
    pub(crate) to_path: Option<String>,
    pub(crate) payload: String,
    pub(crate) status: String,
    pub(crate) created_at: i64,
    pub(crate) applied_at: Option<i64>,
    pub(crate) error: Option<String>,
}

pub(crate) fn path_to_text(path: &Path) -> Result<String, Error> {
    Ok(path.to_str().ok_or_raise(|| ErrorKind::InvalidData("path"))?.to_string())
}

/// Timestamps are stored as unix milliseconds.
pub(crate) fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(millis: i64, field: &'static str) -> Result<OffsetDateTime, Error> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).or_raise(|| ErrorKind::InvalidData(field))
}

impl TryFrom<&PendingChange> for ChangeRow {
    type Error = Error;
    fn try_from(change: &PendingChange) -> Result<Self, Self::Error> {
        Ok(Self {
            id: change.id.as_str().to_string(),
            target_id: change.target_id.clone(),
            change_type: change.change_type.to_string(),
            device_id: change.device_id.clone(),
            from_path: change.from_path.as_deref().map(path_to_text).transpose()?,
            to_path: change.to_path.as_deref().map(path_to_text).transpose()?,
            payload: serde_json::to_string(&change.payload).or_raise(|| ErrorKind::InvalidData("payload"))?,
            status: change.status.to_string(),
            created_at: to_millis(change.created_at),
            applied_at: change.applied_at.map(to_millis),
            error: change.error.clone(),
        })
    }
}

impl TryFrom<ChangeRow> for PendingChange {
    type Error = Error;
    fn try_from(row: ChangeRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: ChangeId::from(row.id),
            target_id: row.target_id,
            change_type: row.change_type.parse::<ChangeType>().or_raise(|| ErrorKind::InvalidData("change type"))?,
            device_id: row.device_id,
            from_path: row.from_path.map(PathBuf::from),
            to_path: row.to_path.map(PathBuf::from),
            payload: serde_json::from_str(&row.payload).or_raise(|| ErrorKind::InvalidData("payload"))?,
            status: row.status.parse::<ChangeStatus>().or_raise(|| ErrorKind::InvalidData("status"))?,
            created_at: from_millis(row.created_at, "creation date")?,
            applied_at: row.applied_at.map(|at| from_millis(at, "application date")).transpose()?,
            error: row.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> ChangeRow {
        ChangeRow {
            id: "c1".to_string(),
            target_id: Some("book-1".to_string()),
            change_type: "epub_meta".to_string(),
            device_id: None,
            from_path: Some("/library/dune.epub".to_string()),
            to_path: None,
            payload: r#"{"title":"Dune"}"#.to_string(),
            status: "pending".to_string(),
            created_at: 1_700_000_000_250,
            applied_at: None,
            error: None,
        }
    }

    #[test]
    fn test_row_to_model() {
        let change = PendingChange::try_from(row()).unwrap();
        assert_eq!(change.change_type, ChangeType::MetadataUpdate);
        assert_eq!(change.from_path, Some(PathBuf::from("/library/dune.epub")));
        assert_eq!(change.payload, json!({"title": "Dune"}));
        assert_eq!(change.created_at.unix_timestamp(), 1_700_000_000);
        assert_eq!(change.created_at.millisecond(), 250);
    }

    #[test]
    fn test_model_to_row() {
        let now = OffsetDateTime::now_utc();
        let mut change = PendingChange::new(ChangeType::DeviceAdd)
            .with_device("kobo")
            .with_paths(Some(PathBuf::from("/library/a.epub")), Some(PathBuf::from("/mnt/kobo/a.epub")));
        change.mark_applied(now);
        let row = ChangeRow::try_from(&change).unwrap();
        assert_eq!(row.change_type, "device_add");
        assert_eq!(row.status, "applied");
        assert_eq!(row.payload, "null");
        assert_eq!(row.applied_at, Some(to_millis(now)));

        let back = PendingChange::try_from(row).unwrap();
        // Anything finer than a millisecond is dropped.
        let created = change.created_at;
        assert_eq!(back.created_at, created.replace_millisecond(created.millisecond()).unwrap());
        assert_eq!(back.applied_at.map(to_millis), Some(to_millis(now)));
        assert_eq!(back.to_path, change.to_path);
    }

    #[test]
    fn test_invalid_rows_are_rejected() {
        let mut bad = row();
        bad.status = "archived".to_string();
        let err = PendingChange::try_from(bad).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData("status")));

        let mut bad = row();
        bad.change_type = "shred".to_string();
        assert!(PendingChange::try_from(bad).is_err());
    }
}
