use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{path_to_text, to_millis};
use async_trait::async_trait;
use exn::ResultExt;
use folio_assets::error::{ErrorKind as AssetErrorKind, Result as AssetResult};
use folio_assets::{AssetBlob, AssetKey, AssetResolver};
use sqlx::SqlitePool;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;

/// Cover images saved on local disk, indexed by item id.
///
/// As an [`AssetResolver`], the key is the item id. An item with no recorded
/// cover, or whose cover file is gone or empty, resolves to `None`.
#[derive(Debug, Clone)]
pub struct CoverStore {
    pool: SqlitePool,
}
impl From<&Database> for CoverStore {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl CoverStore {
    pub async fn save_cover(&self, item_id: &str, path: impl AsRef<Path>) -> Result<()> {
        sqlx::query(include_str!("../queries/insert_cover.sql"))
            .bind(item_id)
            .bind(path_to_text(path.as_ref())?)
            .bind(to_millis(OffsetDateTime::now_utc()))
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub async fn latest_cover_path(&self, item_id: &str) -> Result<Option<PathBuf>> {
        let path: Option<String> = sqlx::query_scalar(include_str!("../queries/latest_cover.sql"))
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(path.map(PathBuf::from))
    }
}

fn mime_type(path: &Path) -> &'static str {
    let extension = path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

#[async_trait]
impl AssetResolver for CoverStore {
    async fn resolve(&self, key: &AssetKey) -> AssetResult<Option<AssetBlob>> {
        let Some(path) = self.latest_cover_path(key.as_str()).await.or_raise(|| AssetErrorKind::Resolve)? else {
            return Ok(None);
        };
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                tracing::debug!(%key, path = %path.display(), "Cover file is missing");
                return Ok(None);
            },
            Err(err) => exn::bail!(AssetErrorKind::Unavailable(format!("{}: {err}", path.display()))),
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(AssetBlob::new(mime_type(&path), bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    async fn store() -> CoverStore {
        CoverStore::from(&Database::connect_in_memory().await.unwrap())
    }

    #[rstest]
    #[case("cover.png", "image/png")]
    #[case("cover.PNG", "image/png")]
    #[case("cover.webp", "image/webp")]
    #[case("cover.jpg", "image/jpeg")]
    #[case("cover.jpeg", "image/jpeg")]
    #[case("cover", "image/jpeg")]
    fn test_mime_type(#[case] path: &str, #[case] expected: &str) {
        assert_eq!(mime_type(Path::new(path)), expected);
    }

    #[tokio::test]
    async fn test_newest_cover_wins() {
        let dir = TempDir::new().unwrap();
        let (old, new) = (dir.path().join("old.jpg"), dir.path().join("new.png"));
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&new, b"new").unwrap();

        let store = store().await;
        store.save_cover("book-1", &old).await.unwrap();
        store.save_cover("book-1", &new).await.unwrap();
        assert_eq!(store.latest_cover_path("book-1").await.unwrap(), Some(new));

        let blob = store.resolve(&AssetKey::from("book-1")).await.unwrap().unwrap();
        assert_eq!(blob, AssetBlob::new("image/png", b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_absent_covers() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty.jpg");
        std::fs::write(&empty, b"").unwrap();

        let store = store().await;
        store.save_cover("empty", &empty).await.unwrap();
        store.save_cover("deleted", dir.path().join("gone.jpg")).await.unwrap();

        for key in ["unknown", "empty", "deleted"] {
            assert_eq!(store.resolve(&AssetKey::from(key)).await.unwrap(), None, "{key}");
        }
    }

    #[tokio::test]
    async fn test_unreadable_cover_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = store().await;
        // A directory cannot be read as a file.
        store.save_cover("dir", dir.path()).await.unwrap();
        let err = store.resolve(&AssetKey::from("dir")).await.unwrap_err();
        assert!(matches!(&*err, AssetErrorKind::Unavailable(_)));
    }
}
