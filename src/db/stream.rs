//! Cursor-paginated streaming of a model's embeddings.
//!
//! A producer task pages through the embeddings table by id and hands each
//! page to the consumer over a bounded channel. Each page is fetched with one
//! extra row so the final page is known without a trailing empty fetch.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::embeddings::{decode_vector, Embedding};
use super::items::{item_from_row, MediaItem};
use super::Database;
use crate::error::{Error, Result};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// An embedding joined with the item it describes.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEmbedding {
    pub embedding: Embedding,
    pub item: MediaItem,
}

/// One page of a stream. `last` is set on the final page, which may be full.
#[derive(Debug, Clone)]
pub struct EmbeddingBatch {
    pub embeddings: Vec<StoredEmbedding>,
    pub last: bool,
}

impl EmbeddingBatch {
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Consumer side of `Database::stream_embeddings`.
///
/// `next_batch` yields `Some(Ok(batch))` while pages remain, `Some(Err(..))`
/// once if the fetch failed or the stream was cancelled, and `None` after the
/// stream has ended. Dropping the stream stops the producer.
#[derive(Debug)]
pub struct EmbeddingStream {
    rx: mpsc::Receiver<Result<EmbeddingBatch>>,
    cancel: CancellationToken,
    done: bool,
}

impl EmbeddingStream {
    pub async fn next_batch(&mut self) -> Option<Result<EmbeddingBatch>> {
        if self.done {
            return None;
        }

        let next = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Some(Err(Error::Cancelled)),
            msg = self.rx.recv() => msg,
        };

        match &next {
            Some(Ok(batch)) if !batch.last => {}
            _ => self.done = true,
        }
        next
    }
}

impl Drop for EmbeddingStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Database {
    /// Streams every embedding of `model` in id order, `batch_size` per page.
    ///
    /// The producer checks `cancel` before each page fetch; cancelling it (or
    /// dropping the stream) ends the scan without reading further pages.
    pub fn stream_embeddings(&self, model: &str, batch_size: usize, cancel: &CancellationToken) -> EmbeddingStream {
        let batch_size = batch_size.max(1);
        let cancel = cancel.child_token();
        let (tx, rx) = mpsc::channel(1);

        let db = self.clone();
        let model = model.to_owned();
        let token = cancel.clone();
        tokio::spawn(async move {
            let mut after = 0i64;
            let mut pages = 0usize;
            loop {
                if token.is_cancelled() {
                    debug!(model = %model, pages, "Embedding stream cancelled");
                    break;
                }

                let page_model = model.clone();
                let fetched = db
                    .with_conn(move |conn| fetch_page(conn, &page_model, after, batch_size + 1))
                    .await;

                let msg = match fetched {
                    Ok(mut rows) => {
                        if rows.is_empty() {
                            break;
                        }
                        let last = rows.len() <= batch_size;
                        rows.truncate(batch_size);
                        if let Some(tail) = rows.last() {
                            after = tail.embedding.id;
                        }
                        pages += 1;
                        debug!(model = %model, page = pages, rows = rows.len(), last, "Fetched embedding page");
                        Ok(EmbeddingBatch { embeddings: rows, last })
                    }
                    Err(e) => Err(e),
                };
                let stop = !matches!(&msg, Ok(batch) if !batch.last);

                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    sent = tx.send(msg) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
                if stop {
                    break;
                }
            }
        });

        EmbeddingStream { rx, cancel, done: false }
    }
}

fn fetch_page(conn: &Connection, model: &str, after: i64, limit: usize) -> Result<Vec<StoredEmbedding>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT e.id, e.item_id, e.model, e.vector, e.created_at,
               i.id, i.path, i.mtime, i.width, i.height, i.description,
               i.processed_at, i.attempted_at, i.backend, i.model
        FROM embeddings e
        INNER JOIN media_items i ON e.item_id = i.id
        WHERE e.model = ?1 AND e.id > ?2
        ORDER BY e.id
        LIMIT ?3
        "#,
    )?;
    let rows = stmt.query_map(params![model, after, limit as i64], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Vec<u8>>(3)?,
            row.get::<_, DateTime<Utc>>(4)?,
            item_from_row(row, 5)?,
        ))
    })?;

    let mut page = Vec::with_capacity(limit);
    for row in rows {
        let (id, item_id, model, blob, created_at, item) = row?;
        let vector = decode_vector(&blob).map_err(|e| match e {
            Error::Integrity(msg) => Error::Integrity(format!("embedding {id}: {msg}")),
            other => other,
        })?;
        page.push(StoredEmbedding {
            embedding: Embedding {
                id,
                item_id,
                model,
                vector,
                created_at,
            },
            item,
        });
    }
    Ok(page)
}
