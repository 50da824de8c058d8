use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Image files under `directory` whose extension is in `extensions`
/// (case-insensitive), sorted by path.
pub fn discover_images(directory: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = WalkDir::new(directory)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| has_extension(path, extensions))
        .collect();

    // Sort by path for consistent ordering
    images.sort();
    images
}

pub fn has_extension(path: &Path, extensions: &[String]) -> bool {
    match path.extension() {
        Some(ext) => {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            extensions.iter().any(|e| e.to_lowercase() == ext_lower)
        }
        None => false,
    }
}
