//! Media item rows: bulk insertion from library scans and description state.

use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, Row};
use tracing::debug;

use super::Database;
use crate::error::{Error, Result};

/// One indexed file.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaItem {
    pub id: i64,
    pub path: String,
    pub mtime: DateTime<Utc>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub description: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub backend: Option<String>,
    pub model: Option<String>,
}

impl MediaItem {
    /// Description failed or the file was missing; not retried automatically.
    pub fn is_failed(&self) -> bool {
        self.attempted_at.is_some() && self.processed_at.is_none()
    }
}

/// A file found by a library scan, not yet stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMediaItem {
    pub path: String,
    pub mtime: DateTime<Utc>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

pub(crate) const ITEM_COLUMNS: &str =
    "id, path, mtime, width, height, description, processed_at, attempted_at, backend, model";

/// Reads an item from `row`, whose columns start at `offset` in `ITEM_COLUMNS` order.
pub(crate) fn item_from_row(row: &Row, offset: usize) -> rusqlite::Result<MediaItem> {
    Ok(MediaItem {
        id: row.get(offset)?,
        path: row.get(offset + 1)?,
        mtime: row.get(offset + 2)?,
        width: row.get(offset + 3)?,
        height: row.get(offset + 4)?,
        description: row.get(offset + 5)?,
        processed_at: row.get(offset + 6)?,
        attempted_at: row.get(offset + 7)?,
        backend: row.get(offset + 8)?,
        model: row.get(offset + 9)?,
    })
}

fn query_items(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<MediaItem>> {
    let mut stmt = conn.prepare(sql)?;
    let items = stmt
        .query_map(params, |row| item_from_row(row, 0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(items)
}

impl Database {
    /// Inserts new items, skipping paths already stored. Rows are written in
    /// multi-row statements of at most `batch_size` items, all inside one
    /// transaction. Returns the number of rows actually inserted.
    pub async fn insert_items(&self, items: Vec<NewMediaItem>, batch_size: usize) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        let batch_size = batch_size.max(1);

        self.transaction(move |tx| {
            let mut inserted = 0;
            for chunk in items.chunks(batch_size) {
                let mut sql = String::from(
                    "INSERT OR IGNORE INTO media_items (path, mtime, width, height) VALUES ",
                );
                let mut values: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() * 4);
                for (i, item) in chunk.iter().enumerate() {
                    if i > 0 {
                        sql.push(',');
                    }
                    sql.push_str("(?, ?, ?, ?)");
                    values.push(&item.path);
                    values.push(&item.mtime);
                    values.push(&item.width);
                    values.push(&item.height);
                }
                inserted += tx.execute(&sql, values.as_slice())?;
            }
            debug!(offered = items.len(), inserted, "Inserted media items");
            Ok(inserted)
        })
        .await
    }

    /// Items with neither a description nor a failed attempt, by id.
    pub async fn items_pending_description(&self) -> Result<Vec<MediaItem>> {
        self.with_conn(|conn| {
            query_items(
                conn,
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM media_items \
                     WHERE processed_at IS NULL AND attempted_at IS NULL ORDER BY id"
                ),
                &[],
            )
        })
        .await
    }

    /// Stores a generated description for one item.
    pub async fn mark_described(
        &self,
        id: i64,
        description: &str,
        model: &str,
        backend: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let (description, model, backend) = (description.to_owned(), model.to_owned(), backend.to_owned());
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE media_items SET description = ?1, model = ?2, backend = ?3, processed_at = ?4 WHERE id = ?5",
                params![description, model, backend, at, id],
            )?;
            expect_one(changed, id)
        })
        .await
    }

    /// Records a failed description attempt so the item is not retried forever.
    pub async fn mark_attempted(&self, id: i64, model: &str, backend: &str, at: DateTime<Utc>) -> Result<()> {
        let (model, backend) = (model.to_owned(), backend.to_owned());
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE media_items SET model = ?1, backend = ?2, attempted_at = ?3 WHERE id = ?4",
                params![model, backend, at, id],
            )?;
            expect_one(changed, id)
        })
        .await
    }

    /// Described items that have no embedding for `model`.
    pub async fn items_missing_embedding(&self, model: &str) -> Result<Vec<MediaItem>> {
        let model = model.to_owned();
        self.with_conn(move |conn| {
            query_items(
                conn,
                r#"
                SELECT i.id, i.path, i.mtime, i.width, i.height, i.description,
                       i.processed_at, i.attempted_at, i.backend, i.model
                FROM media_items i
                LEFT JOIN embeddings e ON e.item_id = i.id AND e.model = ?1
                WHERE i.description IS NOT NULL AND e.id IS NULL
                ORDER BY i.id
                "#,
                &[&model],
            )
        })
        .await
    }

    pub async fn count_items(&self) -> Result<i64> {
        self.with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM media_items", [], |row| row.get(0))?))
            .await
    }
}

fn expect_one(changed: usize, id: i64) -> Result<()> {
    if changed == 0 {
        return Err(Error::NotFound { kind: "media item", id });
    }
    Ok(())
}
