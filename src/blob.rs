//! Read access to the binary object store holding photo variants, keyed
//! by photo id. The upload pipeline writes it; the catalog only reads.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::photos::validate_photo_id;
use crate::error::{CatalogError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// The uploaded file, byte for byte.
    Original,
    /// Small JPEG for grids.
    Thumbnail,
    /// Large JPEG for the detail view.
    Default,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Variant::Original, Variant::Thumbnail, Variant::Default];

    /// Container (directory) the variant lives in.
    pub fn container(&self) -> &'static str {
        match self {
            Variant::Original => "originals",
            Variant::Thumbnail => "thumbnails",
            Variant::Default => "default",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "original" => Some(Variant::Original),
            "thumbnail" => Some(Variant::Thumbnail),
            "default" => Some(Variant::Default),
            _ => None,
        }
    }
}

pub trait BlobStore: Send + Sync {
    /// Stream a stored variant. `NotFound` when the uploader never wrote it.
    fn get(&self, photo_id: &str, variant: Variant) -> Result<Box<dyn Read + Send>>;

    fn exists(&self, photo_id: &str, variant: Variant) -> Result<bool>;
}

/// Blob store backed by one directory per container.
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, photo_id: &str, variant: Variant) -> Result<PathBuf> {
        // Ids are plain hex, so they can never escape the container.
        validate_photo_id(photo_id)?;
        Ok(self.root.join(variant.container()).join(photo_id))
    }
}

impl BlobStore for DirBlobStore {
    fn get(&self, photo_id: &str, variant: Variant) -> Result<Box<dyn Read + Send>> {
        let path = self.blob_path(photo_id, variant)?;
        match File::open(&path) {
            Ok(file) => {
                debug!("Streaming {}", path.display());
                Ok(Box::new(file))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CatalogError::not_found(
                "blob",
                format!("{}/{}", variant.container(), photo_id),
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, photo_id: &str, variant: Variant) -> Result<bool> {
        Ok(self.blob_path(photo_id, variant)?.is_file())
    }
}
