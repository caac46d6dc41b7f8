//! Background indexing jobs: describe new images, then embed their descriptions.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::config::IndexerConfig;
use crate::db::Database;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOptions {
    /// Process at most this many items.
    pub limit: Option<usize>,
    /// Failures tolerated per run before it is aborted.
    pub max_errors: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            limit: None,
            max_errors: 5,
        }
    }
}

impl From<&IndexerConfig> for IndexOptions {
    fn from(config: &IndexerConfig) -> Self {
        Self {
            limit: None,
            max_errors: config.max_errors,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    /// Items waiting when the run started.
    pub pending: usize,
    pub processed: usize,
    pub failed: usize,
    /// Items whose source file no longer exists. These never abort a run.
    pub missing: usize,
    /// The run stopped early because it was cancelled.
    pub cancelled: bool,
}

/// Describes items that have never been attempted. Failures and missing
/// files are recorded with `mark_attempted` so they are not retried; only
/// failures count toward `max_errors`.
pub async fn describe_pending(
    db: &Database,
    backend: &dyn Backend,
    options: &IndexOptions,
    cancel: &CancellationToken,
) -> Result<IndexReport> {
    let items = db.items_pending_description().await?;
    let mut report = IndexReport {
        pending: items.len(),
        ..IndexReport::default()
    };
    info!(pending = report.pending, backend = backend.name(), "Describing images");

    let (model, name) = (backend.vision_model(), backend.name());
    for item in items.into_iter().take(options.limit.unwrap_or(usize::MAX)) {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }

        let described = match tokio::fs::read(&item.path).await {
            Ok(image) => backend.describe_image(image, cancel).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(item_id = item.id, path = %item.path, "Image file is missing, skipping");
                db.mark_attempted(item.id, model, name, Utc::now()).await?;
                report.missing += 1;
                continue;
            }
            Err(e) => Err(Error::Io(e)),
        };

        match described {
            Ok(description) => {
                db.mark_described(item.id, &description, model, name, Utc::now()).await?;
                report.processed += 1;
                info!(item_id = item.id, path = %item.path, "Described image");
            }
            Err(e) if e.is_cancelled() => {
                report.cancelled = true;
                break;
            }
            Err(e) => {
                warn!(item_id = item.id, path = %item.path, error = %e, "Failed to describe image");
                db.mark_attempted(item.id, model, name, Utc::now()).await?;
                report.failed += 1;
                if report.failed > options.max_errors {
                    return Err(Error::stage("describe images", give_up(report.failed, e)));
                }
            }
        }
    }

    info!(?report, "Describe run finished");
    Ok(report)
}

/// Embeds every described item lacking an embedding for the backend's model.
pub async fn embed_missing(
    db: &Database,
    backend: &dyn Backend,
    options: &IndexOptions,
    cancel: &CancellationToken,
) -> Result<IndexReport> {
    let model = backend.embedding_model();
    let items = db.items_missing_embedding(model).await?;
    let mut report = IndexReport {
        pending: items.len(),
        ..IndexReport::default()
    };
    info!(pending = report.pending, model, "Embedding descriptions");

    for item in items.into_iter().take(options.limit.unwrap_or(usize::MAX)) {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        let Some(description) = item.description.as_deref() else {
            continue;
        };

        let stored = match backend.embed(description, cancel).await {
            Ok(vector) => db.create_embedding(vector, model, item.id, Utc::now()).await,
            Err(e) => Err(e),
        };

        match stored {
            Ok(embedding) => {
                report.processed += 1;
                info!(item_id = item.id, embedding_id = embedding.id, "Stored embedding");
            }
            Err(e) if e.is_cancelled() => {
                report.cancelled = true;
                break;
            }
            Err(e) => {
                warn!(item_id = item.id, error = %e, "Failed to embed description");
                report.failed += 1;
                if report.failed > options.max_errors {
                    return Err(Error::stage("embed descriptions", give_up(report.failed, e)));
                }
            }
        }
    }

    info!(?report, "Embedding run finished");
    Ok(report)
}

fn give_up(failed: usize, last: Error) -> Error {
    Error::Backend(format!("giving up after {failed} failures, last: {last}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::StubBackend;
    use crate::db::NewMediaItem;
    use std::path::Path;
    use tempfile::tempdir;

    async fn library(dir: &Path, files: &[(&str, &str)]) -> Database {
        let db = Database::open_in_memory().await.unwrap();
        let mut items = Vec::new();
        for (name, contents) in files {
            let path = dir.join(name);
            if !contents.is_empty() {
                std::fs::write(&path, contents).unwrap();
            }
            items.push(NewMediaItem {
                path: path.to_string_lossy().to_string(),
                mtime: Utc::now(),
                width: None,
                height: None,
            });
        }
        db.insert_items(items, 10).await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_describe_records_successes_and_failures() {
        let dir = tempdir().unwrap();
        // An empty entry is never written, so its file is missing.
        let db = library(dir.path(), &[("a.jpg", "dog"), ("b.jpg", "corrupt"), ("c.jpg", "")]).await;
        let backend = StubBackend::new("m");

        let report = describe_pending(&db, &backend, &IndexOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            report,
            IndexReport { pending: 3, processed: 1, failed: 1, missing: 1, cancelled: false }
        );

        assert!(db.items_pending_description().await.unwrap().is_empty());
        let described = db.items_missing_embedding("m").await.unwrap();
        assert_eq!(described.len(), 1);
        assert_eq!(described[0].description.as_deref(), Some("a photo of dog"));
        assert_eq!(described[0].model.as_deref(), Some("stub-vision"));
    }

    #[tokio::test]
    async fn test_missing_files_do_not_abort_describe() {
        let dir = tempdir().unwrap();
        let mut files: Vec<(String, &str)> = (0..6).map(|i| (format!("gone_{i}.jpg"), "")).collect();
        files.push(("z_present.jpg".to_string(), "heron"));
        let files: Vec<(&str, &str)> = files.iter().map(|(n, c)| (n.as_str(), *c)).collect();
        let db = library(dir.path(), &files).await;
        let backend = StubBackend::new("m");

        let report = describe_pending(&db, &backend, &IndexOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            report,
            IndexReport { pending: 7, processed: 1, failed: 0, missing: 6, cancelled: false }
        );
        assert!(db.items_pending_description().await.unwrap().is_empty());
        let described = db.items_missing_embedding("m").await.unwrap();
        assert_eq!(described.len(), 1);
        assert_eq!(described[0].description.as_deref(), Some("a photo of heron"));
    }

    #[tokio::test]
    async fn test_describe_respects_limit() {
        let dir = tempdir().unwrap();
        let db = library(dir.path(), &[("a.jpg", "cat"), ("b.jpg", "owl"), ("c.jpg", "fox")]).await;
        let backend = StubBackend::new("m");
        let options = IndexOptions { limit: Some(2), ..IndexOptions::default() };

        let report = describe_pending(&db, &backend, &options, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(db.items_pending_description().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_describe_gives_up_after_too_many_failures() {
        let dir = tempdir().unwrap();
        let files: Vec<(String, &str)> = (0..4).map(|i| (format!("{i}.jpg"), "corrupt")).collect();
        let files: Vec<(&str, &str)> = files.iter().map(|(n, c)| (n.as_str(), *c)).collect();
        let db = library(dir.path(), &files).await;
        let backend = StubBackend::new("m");
        let options = IndexOptions { limit: None, max_errors: 2 };

        let err = describe_pending(&db, &backend, &options, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Stage { stage: "describe images", .. }));
        // The fourth item was never attempted.
        assert_eq!(db.items_pending_description().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_describe_touches_nothing() {
        let dir = tempdir().unwrap();
        let db = library(dir.path(), &[("a.jpg", "cat")]).await;
        let backend = StubBackend::new("m");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = describe_pending(&db, &backend, &IndexOptions::default(), &cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.processed, 0);
        assert_eq!(db.items_pending_description().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_embed_missing_is_idempotent() {
        let dir = tempdir().unwrap();
        let db = library(dir.path(), &[("a.jpg", "cat"), ("b.jpg", "heron")]).await;
        let backend = StubBackend::new("m").deriving_embeddings();
        let cancel = CancellationToken::new();
        describe_pending(&db, &backend, &IndexOptions::default(), &cancel).await.unwrap();

        let first = embed_missing(&db, &backend, &IndexOptions::default(), &cancel).await.unwrap();
        assert_eq!(first.processed, 2);
        assert_eq!(db.count_embeddings("m").await.unwrap(), 2);

        let second = embed_missing(&db, &backend, &IndexOptions::default(), &cancel).await.unwrap();
        assert_eq!(second, IndexReport::default());
    }

    #[tokio::test]
    async fn test_embed_failures_are_counted() {
        let dir = tempdir().unwrap();
        let db = library(dir.path(), &[("a.jpg", "cat")]).await;
        let describer = StubBackend::new("m");
        let cancel = CancellationToken::new();
        describe_pending(&db, &describer, &IndexOptions::default(), &cancel).await.unwrap();

        // No canned or derived embeddings, so every embed call fails.
        let report = embed_missing(&db, &describer, &IndexOptions::default(), &cancel).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(db.count_embeddings("m").await.unwrap(), 0);
    }
}
