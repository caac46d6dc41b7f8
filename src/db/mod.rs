//! Durable store for media items and their embeddings.
//!
//! SQLite does not support concurrent writers, so a single connection sits
//! behind a mutex and every operation runs on the blocking pool.

pub mod embeddings;
pub mod evolve;
pub mod items;
mod schema;
pub mod stream;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::Result;

pub use embeddings::{decode_vector, encode_vector, Embedding, EmbeddingSummary, ResolvedEmbedding};
pub use evolve::Evolution;
pub use items::{MediaItem, NewMediaItem};
pub use stream::{EmbeddingBatch, EmbeddingStream, StoredEmbedding};

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Opens the store at `path`, creating it if necessary, and evolves its
    /// schema to the current layout. An incompatible store is a fatal error.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = path.clone();

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = file.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let mut conn = Connection::open(&file)?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            let outcome = evolve::evolve(&mut conn, Some(&file))?;
            info!(path = %file.display(), ?outcome, "Store opened");
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Opens a private in-memory store.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection> {
            let mut conn = Connection::open_in_memory()?;
            evolve::evolve(&mut conn, None)?;
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runs `f` against the connection on the blocking pool.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await?
    }

    /// Runs `f` inside a transaction that commits only if `f` succeeds.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            let result = f(&tx)?;
            tx.commit()?;
            Ok(result)
        })
        .await?
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_in_memory_creates_tables() {
        let db = Database::open_in_memory().await.unwrap();

        let tables: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
            .unwrap();

        assert!(tables.contains(&"media_items".to_string()));
        assert!(tables.contains(&"embeddings".to_string()));
        assert!(tables.contains(&"_schema_history".to_string()));
    }

    #[tokio::test]
    async fn test_reopening_file_store_is_a_no_op() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("library.db");

        let db = Database::open(&path).await.unwrap();
        assert_eq!(db.path(), Some(path.as_path()));
        drop(db);

        let db = Database::open(&path).await.unwrap();
        let ledger: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM _schema_history", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(ledger, 1);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().await.unwrap();

        let result: Result<()> = db
            .transaction(|tx| {
                tx.execute(
                    "INSERT INTO media_items (path, mtime) VALUES ('/x.jpg', '2024-01-01')",
                    [],
                )?;
                Err(Error::Integrity("intentional".into()))
            })
            .await;
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM media_items", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
