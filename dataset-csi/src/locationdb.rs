//! File-location database.
//!
//! The database maps every logical file of a dataset to its location below the
//! data root (or below an explicit root) and its size. The FUSE mount reads it
//! to serve the dataset; this crate only builds it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use common::LocationEntry;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::{Connection, Row};
use tokio::sync::mpsc::Receiver;
use tracing::{debug, trace};

use crate::error::LocationDbError;

#[async_trait]
pub trait LocationDb: Send + Sync {
    /// Consumes `entries` until every sender is gone and leaves a finished
    /// database at `path`. Returns the number of entries written.
    async fn build(
        &self,
        path: &Path,
        entries: Receiver<LocationEntry>,
    ) -> Result<u64, LocationDbError>;
}

const CREATE_FILES_TABLE: &str = "CREATE TABLE files (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    size INTEGER NOT NULL,
    root TEXT
)";

/// SQLite-backed location database, one file per staged volume.
#[derive(Clone, Debug, Default)]
pub struct SqliteLocationDb;

impl SqliteLocationDb {
    pub fn new() -> Self {
        SqliteLocationDb
    }

    /// Reads every entry back in insertion order.
    pub async fn read_entries(path: &Path) -> Result<Vec<LocationEntry>, LocationDbError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Delete)
            .read_only(true);
        let mut conn = SqliteConnection::connect_with(&options).await?;
        let rows = sqlx::query("SELECT path, size, root FROM files ORDER BY seq")
            .fetch_all(&mut conn)
            .await?;
        conn.close().await?;

        rows.into_iter()
            .map(|row| -> Result<LocationEntry, LocationDbError> {
                let size: i64 = row.try_get("size")?;
                let root: Option<String> = row.try_get("root")?;
                Ok(LocationEntry {
                    path: row.try_get("path")?,
                    size: u64::try_from(size)
                        .map_err(|_| LocationDbError::SizeOverflow(size.unsigned_abs()))?,
                    root: root.map(PathBuf::from),
                })
            })
            .collect()
    }
}

#[async_trait]
impl LocationDb for SqliteLocationDb {
    async fn build(
        &self,
        path: &Path,
        mut entries: Receiver<LocationEntry>,
    ) -> Result<u64, LocationDbError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            // temp file, discarded on failure
            .journal_mode(SqliteJournalMode::Off)
            .create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&options).await?;
        sqlx::query(CREATE_FILES_TABLE).execute(&mut conn).await?;

        let mut count = 0u64;
        let mut tx = conn.begin().await?;
        while let Some(entry) = entries.recv().await {
            let size = i64::try_from(entry.size)
                .map_err(|_| LocationDbError::SizeOverflow(entry.size))?;
            let root = entry.root.as_ref().map(|r| r.to_string_lossy().into_owned());
            // a later entry for the same path wins
            sqlx::query(
                "INSERT INTO files (path, size, root) VALUES (?1, ?2, ?3)
                 ON CONFLICT(path) DO UPDATE SET size = excluded.size, root = excluded.root",
            )
            .bind(entry.path.as_str())
            .bind(size)
            .bind(root)
            .execute(&mut *tx)
            .await?;
            trace!("added file entry {}, size: {}", entry.path, entry.size);
            count += 1;
        }
        tx.commit().await?;
        conn.close().await?;

        debug!("built location db {} with {count} entries", path.display());
        Ok(count)
    }
}
