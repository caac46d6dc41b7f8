use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// Files under `directory` whose extension matches one of `extensions`
/// (case-insensitive), sorted by path. Unreadable entries are logged and skipped.
pub fn discover_images(directory: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let mut images = Vec::new();

    for entry in WalkDir::new(directory).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if let Some(ext) = path.extension() {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            if extensions.iter().any(|e| e.to_lowercase() == ext_lower) {
                images.push(path.to_path_buf());
            }
        }
    }

    images.sort();
    images
}
