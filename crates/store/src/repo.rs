//! Repository for staged changes.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{ChangeRow, to_millis};
use exn::ResultExt;
use folio_ledger::{ChangeStatus, Channel, PendingChange, Target};
use sqlx::SqlitePool;
use time::OffsetDateTime;

/// Persistent store of [`PendingChange`]s.
///
/// Listing is always oldest first. Status transitions and deletions are
/// guarded by `status = 'pending'` in SQL, so a change that has settled can
/// never be re-marked or removed through this repository.
#[derive(Debug, Clone)]
pub struct ChangeRepository {
    pool: SqlitePool,
}
impl From<&Database> for ChangeRepository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl ChangeRepository {
    pub async fn insert(&self, change: &PendingChange) -> Result<()> {
        let row = ChangeRow::try_from(change)?;
        sqlx::query(include_str!("../queries/insert_change.sql"))
            .bind(row.id)
            .bind(row.target_id)
            .bind(row.change_type)
            .bind(row.device_id)
            .bind(row.from_path)
            .bind(row.to_path)
            .bind(row.payload)
            .bind(row.status)
            .bind(row.created_at)
            .bind(row.applied_at)
            .bind(row.error)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub async fn get(&self, id: impl AsRef<str>) -> Result<Option<PendingChange>> {
        let row: Option<ChangeRow> = sqlx::query_as(include_str!("../queries/get_change.sql"))
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(PendingChange::try_from).transpose()
    }

    /// Changes with the given status, or every change, oldest first.
    pub async fn list(&self, status: Option<ChangeStatus>) -> Result<Vec<PendingChange>> {
        let rows: Vec<ChangeRow> = match status {
            Some(status) => sqlx::query_as(include_str!("../queries/list_changes_by_status.sql"))
                .bind(status.to_string())
                .fetch_all(&self.pool)
                .await,
            None => sqlx::query_as(include_str!("../queries/list_changes.sql")).fetch_all(&self.pool).await,
        }
        .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(PendingChange::try_from).collect()
    }

    /// Pending changes of `channel` selected by `target`, oldest first.
    ///
    /// Ids in the target that are unknown or no longer pending are skipped.
    pub async fn pending_in_scope(&self, channel: Channel, target: &Target) -> Result<Vec<PendingChange>> {
        let pending = self.list(Some(ChangeStatus::Pending)).await?;
        Ok(pending
            .into_iter()
            .filter(|change| change.channel() == channel && target.includes(&change.id))
            .collect())
    }

    /// Returns `false` if the change was not pending (or does not exist).
    pub async fn mark_applied(&self, id: impl AsRef<str>, at: OffsetDateTime) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/mark_applied.sql"))
            .bind(to_millis(at))
            .bind(id.as_ref())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns `false` if the change was not pending (or does not exist).
    pub async fn mark_error(&self, id: impl AsRef<str>, message: impl AsRef<str>) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/mark_error.sql"))
            .bind(message.as_ref())
            .bind(id.as_ref())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete the pending changes of `channel` selected by `target`. Returns
    /// how many rows were deleted.
    pub async fn delete_pending(&self, channel: Channel, target: &Target) -> Result<u64> {
        let doomed = self.pending_in_scope(channel, target).await?;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let mut deleted = 0;
        for change in &doomed {
            deleted += sqlx::query(include_str!("../queries/delete_pending.sql"))
                .bind(change.id.as_str())
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?
                .rows_affected();
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(deleted)
    }

    /// Mark the pending changes of `channel` selected by `target` as failed
    /// with `message`. Returns how many were marked.
    pub async fn fail_pending(&self, channel: Channel, target: &Target, message: &str) -> Result<u64> {
        let failing = self.pending_in_scope(channel, target).await?;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let mut failed = 0;
        for change in &failing {
            failed += sqlx::query(include_str!("../queries/mark_error.sql"))
                .bind(message)
                .bind(change.id.as_str())
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?
                .rows_affected();
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(failed)
    }

    /// Like [`get()`](Self::get), but a missing change is an error.
    pub async fn require(&self, id: impl AsRef<str>) -> Result<PendingChange> {
        let id = id.as_ref();
        match self.get(id).await? {
            Some(change) => Ok(change),
            None => exn::bail!(ErrorKind::ChangeNotFound(id.to_string())),
        }
    }
}
