//! Local execution of file and device changes.
//!
//! Devices are modelled as mounted directories, so every device change is a
//! plain filesystem operation between the library path and the device path.
//! Catalog-only change types (metadata, covers, tags, relinking) need the
//! external catalog service and are rejected here.

use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use folio_ledger::{ChangeType, PendingChange};
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;

pub type ExecutorHandle = Arc<dyn ChangeExecutor>;

/// Carries out a single pending change.
#[async_trait]
pub trait ChangeExecutor: Send + Sync {
    async fn execute(&self, change: &PendingChange) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    fn from_path(change: &PendingChange) -> Result<&Path> {
        match change.from_path.as_deref() {
            Some(path) => Ok(path),
            None => exn::bail!(ErrorKind::MissingPath("source")),
        }
    }

    fn to_path(change: &PendingChange) -> Result<&Path> {
        match change.to_path.as_deref() {
            Some(path) => Ok(path),
            None => exn::bail!(ErrorKind::MissingPath("target")),
        }
    }

    async fn create_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await.map_err(ErrorKind::Io)?;
        }
        Ok(())
    }

    async fn rename(change: &PendingChange) -> Result<()> {
        let (from, to) = (Self::from_path(change)?, Self::to_path(change)?);
        Self::create_parent(to).await?;
        fs::rename(from, to).await.map_err(ErrorKind::Io)?;
        Ok(())
    }

    async fn copy(change: &PendingChange) -> Result<()> {
        let (from, to) = (Self::from_path(change)?, Self::to_path(change)?);
        Self::create_parent(to).await?;
        fs::copy(from, to).await.map_err(ErrorKind::Io)?;
        Ok(())
    }

    /// A file that is already gone counts as removed.
    async fn remove(change: &PendingChange) -> Result<()> {
        let path = Self::from_path(change)?;
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Already removed");
                Ok(())
            },
            Err(err) => exn::bail!(ErrorKind::Io(err)),
        }
    }
}

#[async_trait]
impl ChangeExecutor for LocalExecutor {
    #[tracing::instrument(level = "debug", skip_all, fields(id = %change.id, change_type = %change.change_type))]
    async fn execute(&self, change: &PendingChange) -> Result<()> {
        match change.change_type {
            ChangeType::Rename => Self::rename(change).await,
            ChangeType::Delete | ChangeType::DeviceRemove => Self::remove(change).await,
            ChangeType::DeviceAdd | ChangeType::DeviceImport | ChangeType::DeviceUpdate => Self::copy(change).await,
            ChangeType::MetadataUpdate
            | ChangeType::CoverUpdate
            | ChangeType::TagAdd
            | ChangeType::TagRemove
            | ChangeType::RelinkMissing
            | ChangeType::DeactivateMissing => {
                exn::bail!(ErrorKind::Unsupported(change.change_type.to_string()))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn change(change_type: ChangeType, from: Option<PathBuf>, to: Option<PathBuf>) -> PendingChange {
        PendingChange::new(change_type).with_paths(from, to)
    }

    #[tokio::test]
    async fn test_rename_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("inbox/dune.epub");
        let to = dir.path().join("Herbert, Frank/Dune.epub");
        std::fs::create_dir_all(from.parent().unwrap()).unwrap();
        std::fs::write(&from, b"spice").unwrap();

        LocalExecutor.execute(&change(ChangeType::Rename, Some(from.clone()), Some(to.clone()))).await.unwrap();
        assert!(!from.exists());
        assert_eq!(std::fs::read(&to).unwrap(), b"spice");
    }

    #[rstest]
    #[case::add(ChangeType::DeviceAdd)]
    #[case::import(ChangeType::DeviceImport)]
    #[case::update(ChangeType::DeviceUpdate)]
    #[tokio::test]
    async fn test_device_transfers_copy(#[case] change_type: ChangeType) {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("dune.epub");
        let to = dir.path().join("device/books/dune.epub");
        std::fs::write(&from, b"spice").unwrap();

        LocalExecutor.execute(&change(change_type, Some(from.clone()), Some(to.clone()))).await.unwrap();
        assert!(from.exists(), "source is kept");
        assert_eq!(std::fs::read(&to).unwrap(), b"spice");
    }

    #[rstest]
    #[case::delete(ChangeType::Delete)]
    #[case::device_remove(ChangeType::DeviceRemove)]
    #[tokio::test]
    async fn test_removals(#[case] change_type: ChangeType) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dune.epub");
        std::fs::write(&path, b"spice").unwrap();

        LocalExecutor.execute(&change(change_type, Some(path.clone()), None)).await.unwrap();
        assert!(!path.exists());

        // Retrying after the file is gone still succeeds.
        LocalExecutor.execute(&change(change_type, Some(path), None)).await.unwrap();

        let err = LocalExecutor.execute(&change(change_type, Some(dir.path().to_path_buf()), None)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Io(_)));
    }

    #[tokio::test]
    async fn test_missing_paths() {
        let err = LocalExecutor.execute(&change(ChangeType::Rename, Some("a".into()), None)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::MissingPath("target")));
        let err = LocalExecutor.execute(&change(ChangeType::Delete, None, None)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::MissingPath("source")));
    }

    #[rstest]
    #[case(ChangeType::MetadataUpdate)]
    #[case(ChangeType::CoverUpdate)]
    #[case(ChangeType::TagAdd)]
    #[case(ChangeType::TagRemove)]
    #[case(ChangeType::RelinkMissing)]
    #[case(ChangeType::DeactivateMissing)]
    #[tokio::test]
    async fn test_catalog_changes_are_unsupported(#[case] change_type: ChangeType) {
        let err = LocalExecutor.execute(&PendingChange::new(change_type)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Unsupported(name) if name == change_type.as_str()));
    }
}
