//! Library scan: find image files and record the new ones.

pub mod discovery;

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ScannerConfig;
use crate::db::{Database, NewMediaItem};
use crate::error::{Error, Result};

pub use discovery::discover_images;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub found: usize,
    /// Files not already in the store.
    pub inserted: usize,
    /// Files whose metadata could not be read.
    pub unreadable: usize,
}

/// Reads the modification time and, when the image header allows, the pixel
/// dimensions of `path`.
pub fn read_file_info(path: &Path) -> Result<NewMediaItem> {
    let modified = std::fs::metadata(path)?.modified()?;
    let (width, height) = match image::ImageReader::open(path).and_then(|r| r.with_guessed_format()) {
        Ok(reader) => match reader.into_dimensions() {
            Ok((w, h)) => (Some(w), Some(h)),
            Err(_) => (None, None),
        },
        Err(_) => (None, None),
    };

    Ok(NewMediaItem {
        path: path.to_string_lossy().to_string(),
        mtime: DateTime::<Utc>::from(modified),
        width,
        height,
    })
}

/// Walks `root` and inserts every matching file not yet in the store.
/// Cancellation stops the walk between files; nothing is inserted then.
pub async fn scan_library(
    db: &Database,
    root: &Path,
    config: &ScannerConfig,
    cancel: &CancellationToken,
) -> Result<ScanReport> {
    let root = root.canonicalize()?;
    info!(root = %root.display(), "Scanning library");

    let extensions = config.extensions.clone();
    let token = cancel.clone();
    let (items, mut report) = tokio::task::spawn_blocking(move || -> Result<(Vec<NewMediaItem>, ScanReport)> {
        let paths: Vec<PathBuf> = discover_images(&root, &extensions);
        let mut report = ScanReport {
            found: paths.len(),
            ..ScanReport::default()
        };
        let mut items = Vec::with_capacity(paths.len());
        for path in &paths {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match read_file_info(path) {
                Ok(item) => items.push(item),
                Err(e) => {
                    report.unreadable += 1;
                    warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                }
            }
        }
        Ok((items, report))
    })
    .await??;

    report.inserted = db.insert_items(items, config.insert_batch_size).await?;
    info!(
        found = report.found,
        inserted = report.inserted,
        unreadable = report.unreadable,
        "Scan complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::fs;
    use tempfile::tempdir;

    fn write_jpeg(path: &Path, width: u32, height: u32) {
        let img = ImageBuffer::from_pixel(width, height, Rgb([120u8, 80, 200]));
        img.save(path).unwrap();
    }

    #[test]
    fn test_read_file_info_reports_dimensions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wide.jpg");
        write_jpeg(&path, 64, 32);

        let info = read_file_info(&path).unwrap();
        assert_eq!((info.width, info.height), (Some(64), Some(32)));
        assert!(info.path.ends_with("wide.jpg"));
    }

    #[test]
    fn test_read_file_info_tolerates_undecodable_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        fs::write(&path, b"not really a jpeg").unwrap();

        let info = read_file_info(&path).unwrap();
        assert_eq!((info.width, info.height), (None, None));
    }

    #[tokio::test]
    async fn test_rescan_only_inserts_new_files() {
        let dir = tempdir().unwrap();
        write_jpeg(&dir.path().join("one.jpg"), 8, 8);
        write_jpeg(&dir.path().join("two.jpeg"), 8, 8);
        fs::write(dir.path().join("readme.txt"), b"hello").unwrap();

        let db = Database::open_in_memory().await.unwrap();
        let config = ScannerConfig::default();
        let cancel = CancellationToken::new();

        let first = scan_library(&db, dir.path(), &config, &cancel).await.unwrap();
        assert_eq!(first, ScanReport { found: 2, inserted: 2, unreadable: 0 });

        write_jpeg(&dir.path().join("three.jpg"), 8, 8);
        let second = scan_library(&db, dir.path(), &config, &cancel).await.unwrap();
        assert_eq!(second.found, 3);
        assert_eq!(second.inserted, 1);
        assert_eq!(db.count_items().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_scan_inserts_nothing() {
        let dir = tempdir().unwrap();
        write_jpeg(&dir.path().join("one.jpg"), 8, 8);

        let db = Database::open_in_memory().await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = scan_library(&db, dir.path(), &ScannerConfig::default(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(db.count_items().await.unwrap(), 0);
    }
}
