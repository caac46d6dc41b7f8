//! End-to-end query: embed the text, stream the stored vectors of the same
//! model, score them and keep the best matches.
//!
//! Fetching the next page overlaps with scoring the current one. Scoring is
//! CPU bound and runs on the blocking pool, taking the tracker with it.

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::similarity::cosine_similarity;
use super::topk::TopK;
use crate::backend::Backend;
use crate::config::QueryConfig;
use crate::db::{Database, EmbeddingBatch};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    pub top_k: usize,
    pub batch_size: usize,
    /// Scoring failures tolerated per query before it is aborted.
    pub max_errors: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            batch_size: crate::db::stream::DEFAULT_BATCH_SIZE,
            max_errors: 5,
        }
    }
}

impl From<&QueryConfig> for QueryOptions {
    fn from(config: &QueryConfig) -> Self {
        Self {
            top_k: config.top_k,
            batch_size: config.batch_size,
            max_errors: config.max_errors,
        }
    }
}

/// One ranked match, best first, `rank` starting at 1.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub rank: usize,
    pub score: f32,
    pub embedding_id: i64,
    pub item_id: i64,
    pub path: String,
    pub description: Option<String>,
}

/// Ranks every stored embedding of the backend's embedding model against `query`.
pub async fn run_query(
    db: &Database,
    backend: &dyn Backend,
    query: &str,
    options: &QueryOptions,
    cancel: &CancellationToken,
) -> Result<Vec<QueryResult>> {
    let started = Instant::now();
    let model = backend.embedding_model();
    info!(backend = backend.name(), model, top_k = options.top_k, "Running query");

    let mut stream = db.stream_embeddings(model, options.batch_size, cancel);
    let (embedded, first) = tokio::join!(backend.embed(query, cancel), stream.next_batch());

    let query_vector = embedded.map_err(|e| Error::stage("query embedding", e))?;
    check_query_vector(&query_vector).map_err(|e| Error::stage("query embedding", e))?;
    let mut batch = match first {
        Some(batch) => batch.map_err(|e| Error::stage("first batch", e))?,
        None => {
            info!(model, "No stored embeddings for model");
            return Ok(Vec::new());
        }
    };

    let query_vector = Arc::new(query_vector);
    let mut tracker = TopK::new(options.top_k);
    let mut errors = 0usize;
    let mut scanned = 0usize;

    loop {
        scanned += batch.len();
        let scoring = score_batch(query_vector.clone(), batch, tracker, errors, options.max_errors);
        let (scored, next) = tokio::join!(scoring, stream.next_batch());
        (tracker, errors) = scored?;

        batch = match next {
            Some(next) => next.map_err(|e| Error::stage("next batch", e))?,
            None => break,
        };
    }

    let ranked = tracker.into_sorted_vec();
    let ids: Vec<i64> = ranked.iter().map(|entry| entry.value).collect();
    let resolved = db
        .resolve_embeddings_with_items(&ids)
        .await
        .map_err(|e| Error::stage("resolve results", e))?;

    let results: Vec<QueryResult> = ranked
        .into_iter()
        .filter_map(|entry| {
            let hit = resolved.get(&entry.value)?;
            Some((entry.score, hit))
        })
        .enumerate()
        .map(|(i, (score, hit))| QueryResult {
            rank: i + 1,
            score,
            embedding_id: hit.embedding.id,
            item_id: hit.item.id,
            path: hit.item.path.clone(),
            description: hit.item.description.clone(),
        })
        .collect();

    info!(
        scanned,
        errors,
        results = results.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Query finished"
    );
    Ok(results)
}

fn check_query_vector(vector: &[f32]) -> Result<()> {
    if vector.is_empty() {
        return Err(Error::Integrity("query embedding is empty".into()));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(Error::Integrity("query embedding has non-finite values".into()));
    }
    Ok(())
}

/// Scores one page into `tracker`. Returns the tracker and the running error
/// count, or fails once that count exceeds `max_errors`.
async fn score_batch(
    query: Arc<Vec<f32>>,
    batch: EmbeddingBatch,
    mut tracker: TopK<i64>,
    mut errors: usize,
    max_errors: usize,
) -> Result<(TopK<i64>, usize)> {
    tokio::task::spawn_blocking(move || {
        for stored in &batch.embeddings {
            match cosine_similarity(&query, &stored.embedding.vector) {
                Ok(score) => {
                    tracker.push(stored.embedding.id, score);
                }
                Err(e) => {
                    errors += 1;
                    warn!(
                        embedding_id = stored.embedding.id,
                        item_id = stored.item.id,
                        error = %e,
                        "Skipping embedding"
                    );
                    if errors > max_errors {
                        return Err(Error::Integrity(format!(
                            "aborting query after {errors} scoring errors, last: {e}"
                        )));
                    }
                }
            }
        }
        debug!(scored = batch.len(), kept = tracker.len(), "Scored batch");
        Ok((tracker, errors))
    })
    .await?
}
