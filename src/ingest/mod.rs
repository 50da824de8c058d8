//! File ingestion: hash the file, read its metadata and sidecar hints, and
//! register the photo with the catalog. Binary variants are uploaded by a
//! separate pipeline and are not touched here.

pub mod discovery;
pub mod folder;
pub mod hashing;
pub mod metadata;

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::IngestConfig;
use crate::db::{Database, NewPhoto, RequestContext};

pub use discovery::discover_images;
pub use folder::{folder_metadata_for, FolderMetadata};
pub use hashing::sha256_file;
pub use metadata::{extract_metadata, ImageMetadata};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "photo_id", rename_all = "snake_case")]
pub enum ImportOutcome {
    Registered(String),
    AlreadyPresent(String),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSummary {
    pub found: usize,
    pub registered: usize,
    pub already_present: usize,
    pub failed: usize,
}

pub struct Importer<'a> {
    db: &'a Database,
    config: &'a IngestConfig,
}

impl<'a> Importer<'a> {
    pub fn new(db: &'a Database, config: &'a IngestConfig) -> Self {
        Self { db, config }
    }

    /// Import every matching image below `root`. A file that fails is logged
    /// and counted; the walk carries on.
    pub fn import_dir(&self, ctx: &RequestContext, root: &Path) -> Result<ImportSummary> {
        if !root.is_dir() {
            anyhow::bail!("{} is not a directory", root.display());
        }
        let paths = discover_images(root, &self.config.extensions);
        info!("Importing {} files from {}", paths.len(), root.display());

        let mut summary = ImportSummary {
            found: paths.len(),
            ..ImportSummary::default()
        };
        for path in &paths {
            if ctx.cancel().is_cancelled() {
                warn!(
                    "Import cancelled after {} files",
                    summary.registered + summary.already_present + summary.failed
                );
                break;
            }
            match self.import_file(ctx, path, Some(root)) {
                Ok(ImportOutcome::Registered(_)) => summary.registered += 1,
                Ok(ImportOutcome::AlreadyPresent(_)) => summary.already_present += 1,
                Err(e) => {
                    warn!("Failed to import {}: {:#}", path.display(), e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Import finished: {} new, {} already present, {} failed",
            summary.registered, summary.already_present, summary.failed
        );
        Ok(summary)
    }

    /// Import one file. Sidecars are read from `root` down to the file's
    /// folder. A file whose hash is already catalogued only gets missing
    /// dimensions filled in.
    pub fn import_file(&self, ctx: &RequestContext, path: &Path, root: Option<&Path>) -> Result<ImportOutcome> {
        let photo_id = sha256_file(path)?;
        let metadata = extract_metadata(path);
        let sidecar = folder_metadata_for(path, root)?;

        let place_id = match &sidecar.place {
            Some(hint) => self
                .db
                .ensure_place_path(ctx, hint)
                .with_context(|| format!("Failed to resolve place for {}", path.display()))?,
            None => None,
        };

        let date = sidecar.date.unwrap_or_default();
        let photo = NewPhoto {
            id: photo_id.clone(),
            original_filename: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            not_earlier_than: date.not_earlier_than,
            not_later_than: date.not_later_than,
            place_id,
            width: metadata.width,
            height: metadata.height,
            exif: metadata.exif,
        };

        if self
            .db
            .register_photo(ctx, &photo)
            .with_context(|| format!("Failed to register {}", path.display()))?
        {
            return Ok(ImportOutcome::Registered(photo_id));
        }
        if let (Some(width), Some(height)) = (photo.width, photo.height) {
            self.db.backfill_dimensions(ctx, &photo_id, width, height)?;
        }
        Ok(ImportOutcome::AlreadyPresent(photo_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CancelToken, PageRequest, PhotoFilter};
    use image::{DynamicImage, Rgb, RgbImage};
    use std::fs;

    fn write_png(path: &Path, shade: u8) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(30, 15, Rgb([shade, 0, 0])))
            .save(path)
            .unwrap();
    }

    #[test]
    fn test_import_dir_registers_and_is_idempotent() {
        let t = crate::db::test_support::TestDb::new();
        let ctx = t.db.request();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let config = IngestConfig::default();

        write_png(&root.join("1950s").join("a.png"), 10);
        write_png(&root.join("1950s").join("b.png"), 20);
        write_png(&root.join("loose.png"), 30);
        fs::write(root.join("notes.txt"), "not an image").unwrap();
        fs::write(
            root.join("1950s").join(folder::SIDECAR_NAME),
            "date:\n  not_earlier_than: 1950-01-01\n  not_later_than: 1959-12-31\nplace:\n  country: Sweden\n  city: Stockholm\n",
        )
        .unwrap();

        let importer = Importer::new(&t.db, &config);
        let summary = importer.import_dir(&ctx, root).unwrap();
        assert_eq!((summary.found, summary.registered, summary.failed), (3, 3, 0));

        let again = importer.import_dir(&ctx, root).unwrap();
        assert_eq!((again.registered, again.already_present), (0, 3));

        let page = t.db.list_photos(&ctx, &PhotoFilter::default(), PageRequest::default()).unwrap();
        assert_eq!(page.total_count, 3);
        let dated: Vec<_> = page.items.iter().filter(|p| p.not_earlier_than.is_some()).collect();
        assert_eq!(dated.len(), 2);
        assert!(dated.iter().all(|p| p.place_id.is_some()));
        assert_eq!(page.items[0].original_filename, "a.png");
        assert_eq!((page.items[0].width, page.items[0].height), (Some(30), Some(15)));
        assert_eq!(t.db.list_places(&ctx).unwrap().len(), 2);
    }

    #[test]
    fn test_same_content_registered_once() {
        let t = crate::db::test_support::TestDb::new();
        let ctx = t.db.request();
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("a.png"), 1);
        fs::copy(dir.path().join("a.png"), dir.path().join("copy.png")).unwrap();

        let config = IngestConfig::default();
        let importer = Importer::new(&t.db, &config);
        let first = importer.import_file(&ctx, &dir.path().join("a.png"), Some(dir.path())).unwrap();
        let second = importer
            .import_file(&ctx, &dir.path().join("copy.png"), Some(dir.path()))
            .unwrap();

        match first {
            ImportOutcome::Registered(id) => assert_eq!(second, ImportOutcome::AlreadyPresent(id)),
            other => panic!("expected a new photo, got {:?}", other),
        }
    }

    #[test]
    fn test_cancelled_import_stops() {
        let t = crate::db::test_support::TestDb::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let ctx = t.db.request().with_cancel(cancel);
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("a.png"), 1);

        let config = IngestConfig::default();
        let summary = Importer::new(&t.db, &config).import_dir(&ctx, dir.path()).unwrap();
        assert_eq!((summary.found, summary.registered), (1, 0));
    }
}
