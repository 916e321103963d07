use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use sqlx::SqliteConnection;
use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Per-connection settings that `SqliteConnectOptions` has no setter for.
const CONNECTION_PRAGMAS: [&str; 3] =
    ["PRAGMA wal_autocheckpoint = 400", "PRAGMA cache_size = -2048", "PRAGMA temp_store = MEMORY"];

/// Run on close: refresh planner statistics, then hand back pages freed by
/// settled and removed changes.
const CLOSING_PRAGMAS: [&str; 2] = ["PRAGMA optimize", "PRAGMA incremental_vacuum"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
    File(PathBuf),
    Memory,
}

impl Location {
    /// A private in-memory database exists per connection, so it must not be pooled wider than one.
    fn max_connections(&self) -> u32 {
        match self {
            Self::File(_) => 4,
            Self::Memory => 1,
        }
    }

    fn options(&self) -> SqliteConnectOptions {
        let options = SqliteConnectOptions::new()
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            // An apply writes once per item; a concurrent `changes list` must wait, not fail.
            .busy_timeout(Duration::from_millis(1500))
            .auto_vacuum(SqliteAutoVacuum::Incremental);
        match self {
            Self::File(path) => options.filename(path).create_if_missing(true),
            Self::Memory => options.filename(":memory:"),
        }
    }
}

/// Pooled handle to the change and cover store.
///
/// Opening always brings the schema up to date. Repositories are built from a
/// `&Database` and share its pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the store file at `path`, along with any
    /// missing parent directories.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(ErrorKind::Io)?;
        }
        tracing::debug!(path = %path.display(), "Opening store");
        Self::open(Location::File(path.to_path_buf())).await
    }

    /// A throwaway store that lives as long as this handle. Also used by
    /// dependants' tests, so it is not behind `cfg(test)`.
    pub async fn connect_in_memory() -> Result<Self> {
        Self::open(Location::Memory).await
    }

    async fn open(location: Location) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(location.max_connections())
            // Every pooled connection gets the pragmas, not only the first.
            .after_connect(|conn, _| Box::pin(Self::configure(conn)))
            .connect_with(location.options())
            .await
            .or_raise(|| ErrorKind::Database)?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn configure(conn: &mut SqliteConnection) -> sqlx::Result<()> {
        for pragma in CONNECTION_PRAGMAS {
            sqlx::query(pragma).execute(&mut *conn).await?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.or_raise(|| ErrorKind::Migration)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Tidy up and close every connection. The handle (and its clones) must
    /// not be used afterwards.
    pub async fn close(&self) {
        for pragma in CLOSING_PRAGMAS {
            if let Err(err) = sqlx::query(pragma).execute(&self.pool).await {
                tracing::debug!(pragma, error = %err, "Closing pragma failed");
            }
        }
        self.pool.close().await;
    }
}
