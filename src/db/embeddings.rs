//! Embedding storage: the fixed-width vector encoding and point lookups.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, ErrorCode};
use std::collections::HashMap;

use super::items::{item_from_row, MediaItem};
use super::Database;
use crate::error::{Error, Result};

/// A stored embedding vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub id: i64,
    pub item_id: i64,
    pub model: String,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// Embedding metadata without the vector payload.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingSummary {
    pub id: i64,
    pub item_id: i64,
    pub model: String,
    pub dimension: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEmbedding {
    pub embedding: EmbeddingSummary,
    pub item: MediaItem,
}

/// Encodes a vector as big-endian f32 values with no header.
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &val in vector {
        bytes.extend_from_slice(&val.to_be_bytes());
    }
    bytes
}

/// Decodes a blob written by `encode_vector`; the dimension is `len / 4`.
pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Integrity(format!(
            "vector blob of {} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

impl Database {
    /// Stores the embedding of `item_id` under `model`. At most one embedding
    /// may exist per (item, model), and all vectors of a model share a dimension.
    pub async fn create_embedding(
        &self,
        vector: Vec<f32>,
        model: &str,
        item_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Embedding> {
        if vector.is_empty() {
            return Err(Error::Integrity("refusing to store an empty vector".into()));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(Error::Integrity("refusing to store a vector with non-finite values".into()));
        }
        let model = model.to_owned();

        self.with_conn(move |conn| {
            let existing: Option<i64> = match conn.query_row(
                "SELECT length(vector) FROM embeddings WHERE model = ?1 LIMIT 1",
                [&model],
                |row| row.get(0),
            ) {
                Ok(len) => Some(len),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };
            if let Some(len) = existing {
                let dimension = len as usize / 4;
                if dimension != vector.len() {
                    return Err(Error::Integrity(format!(
                        "model {model} stores {dimension}-dimensional vectors, got {}",
                        vector.len()
                    )));
                }
            }

            let inserted = conn.execute(
                "INSERT INTO embeddings (item_id, vector, model, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![item_id, encode_vector(&vector), model, at],
            );
            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                    return Err(Error::Integrity(format!(
                        "item {item_id} already has an embedding for model {model}"
                    )));
                }
                Err(e) => return Err(e.into()),
            }

            Ok(Embedding {
                id: conn.last_insert_rowid(),
                item_id,
                model,
                vector,
                created_at: at,
            })
        })
        .await
    }

    /// Loads one embedding with its vector.
    pub async fn fetch_embedding(&self, id: i64) -> Result<Embedding> {
        self.with_conn(move |conn| {
            let row = conn.query_row(
                "SELECT id, item_id, model, vector, created_at FROM embeddings WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, DateTime<Utc>>(4)?,
                    ))
                },
            );
            let (id, item_id, model, blob, created_at) = match row {
                Ok(row) => row,
                Err(rusqlite::Error::QueryReturnedNoRows) => {
                    return Err(Error::NotFound { kind: "embedding", id })
                }
                Err(e) => return Err(e.into()),
            };

            Ok(Embedding {
                id,
                item_id,
                model,
                vector: decode_vector(&blob)?,
                created_at,
            })
        })
        .await
    }

    pub async fn count_embeddings(&self, model: &str) -> Result<i64> {
        let model = model.to_owned();
        self.with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM embeddings WHERE model = ?1",
                [&model],
                |row| row.get(0),
            )?)
        })
        .await
    }

    /// Looks up embeddings by id together with their items, without loading
    /// vectors. Unknown ids are absent from the result.
    pub async fn resolve_embeddings_with_items(&self, ids: &[i64]) -> Result<HashMap<i64, ResolvedEmbedding>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids = ids.to_vec();

        self.with_conn(move |conn| {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let sql = format!(
                r#"
                SELECT e.id, e.item_id, e.model, length(e.vector), e.created_at,
                       i.id, i.path, i.mtime, i.width, i.height, i.description,
                       i.processed_at, i.attempted_at, i.backend, i.model
                FROM embeddings e
                INNER JOIN media_items i ON e.item_id = i.id
                WHERE e.id IN ({placeholders})
                "#
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(ids.iter()), |row| {
                let len: i64 = row.get(3)?;
                Ok(ResolvedEmbedding {
                    embedding: EmbeddingSummary {
                        id: row.get(0)?,
                        item_id: row.get(1)?,
                        model: row.get(2)?,
                        dimension: len as usize / 4,
                        created_at: row.get(4)?,
                    },
                    item: item_from_row(row, 5)?,
                })
            })?;

            let mut resolved = HashMap::with_capacity(ids.len());
            for row in rows {
                let row = row?;
                resolved.insert(row.embedding.id, row);
            }
            Ok(resolved)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewMediaItem;
    use proptest::prelude::*;

    async fn store_with_items(n: usize) -> (Database, Vec<MediaItem>) {
        let db = Database::open_in_memory().await.unwrap();
        let items = (0..n)
            .map(|i| NewMediaItem {
                path: format!("/library/img_{i}.jpg"),
                mtime: Utc::now(),
                width: None,
                height: None,
            })
            .collect();
        db.insert_items(items, 100).await.unwrap();
        let items = db.items_pending_description().await.unwrap();
        (db, items)
    }

    #[test]
    fn test_encoding_is_big_endian_without_header() {
        let bytes = encode_vector(&[1.0, -2.5]);
        assert_eq!(bytes, vec![0x3f, 0x80, 0x00, 0x00, 0xc0, 0x20, 0x00, 0x00]);
        assert_eq!(decode_vector(&bytes).unwrap(), vec![1.0, -2.5]);
    }

    #[test]
    fn test_decoding_ragged_blob_is_integrity_error() {
        let err = decode_vector(&[0, 0, 128, 63, 1]).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    proptest! {
        #[test]
        fn prop_vector_encoding_preserves_values(vector in prop::collection::vec(-1.0e6f32..1.0e6, 0..64)) {
            let decoded = decode_vector(&encode_vector(&vector)).unwrap();
            prop_assert_eq!(decoded, vector);
        }
    }

    #[tokio::test]
    async fn test_create_and_fetch_embedding() {
        let (db, items) = store_with_items(1).await;

        let created = db
            .create_embedding(vec![0.25, -0.5, 1.0], "text-embedding-3-small", items[0].id, Utc::now())
            .await
            .unwrap();
        let fetched = db.fetch_embedding(created.id).await.unwrap();

        assert_eq!(fetched.vector, vec![0.25, -0.5, 1.0]);
        assert_eq!(fetched.item_id, items[0].id);
        assert_eq!(fetched.model, "text-embedding-3-small");
        assert_eq!(db.count_embeddings("text-embedding-3-small").await.unwrap(), 1);
        assert_eq!(db.count_embeddings("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fetch_missing_embedding_is_not_found() {
        let (db, _) = store_with_items(0).await;
        let err = db.fetch_embedding(7).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "embedding", id: 7 }));
    }

    #[tokio::test]
    async fn test_one_embedding_per_item_and_model() {
        let (db, items) = store_with_items(1).await;
        let id = items[0].id;

        db.create_embedding(vec![1.0, 0.0], "m1", id, Utc::now()).await.unwrap();
        let err = db.create_embedding(vec![0.0, 1.0], "m1", id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));

        db.create_embedding(vec![0.0, 1.0, 0.0], "m2", id, Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn test_dimension_is_fixed_per_model() {
        let (db, items) = store_with_items(2).await;

        db.create_embedding(vec![1.0, 0.0], "m1", items[0].id, Utc::now()).await.unwrap();
        let err = db
            .create_embedding(vec![1.0, 0.0, 0.0], "m1", items[1].id, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[tokio::test]
    async fn test_non_finite_vectors_are_rejected() {
        let (db, items) = store_with_items(2).await;

        let err = db
            .create_embedding(vec![f32::NAN, 1.0], "m", items[0].id, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
        let err = db
            .create_embedding(vec![0.5, f32::NEG_INFINITY], "m", items[1].id, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
        assert_eq!(db.count_embeddings("m").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_blob_fails_fetch() {
        let (db, items) = store_with_items(1).await;
        let item_id = items[0].id;
        let id = db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO embeddings (item_id, vector, model, created_at) VALUES (?1, x'00000000ff', 'm', ?2)",
                    params![item_id, Utc::now()],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .unwrap();

        assert!(matches!(db.fetch_embedding(id).await.unwrap_err(), Error::Integrity(_)));
    }

    #[tokio::test]
    async fn test_resolve_joins_items_without_vectors() {
        let (db, items) = store_with_items(3).await;
        let mut ids = Vec::new();
        for item in &items {
            let e = db.create_embedding(vec![1.0; 8], "m", item.id, Utc::now()).await.unwrap();
            ids.push(e.id);
        }

        let resolved = db.resolve_embeddings_with_items(&[ids[2], ids[0], 999]).await.unwrap();
        assert_eq!(resolved.len(), 2);
        let third = &resolved[&ids[2]];
        assert_eq!(third.item.path, items[2].path);
        assert_eq!(third.embedding.dimension, 8);

        assert!(db.resolve_embeddings_with_items(&[]).await.unwrap().is_empty());
    }
}
