//! `folder.yaml` sidecars: date ranges and place names that apply to every
//! photo below the folder.
//!
//! ```yaml
//! date:
//!   not_earlier_than: 1950-01-01
//!   not_later_than: 1959-12-31
//! place:
//!   country: Sweden
//!   city: Stockholm
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::debug;

use crate::db::PlaceHint;

pub const SIDECAR_NAME: &str = "folder.yaml";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DateHint {
    pub not_earlier_than: Option<NaiveDate>,
    pub not_later_than: Option<NaiveDate>,
}

/// Contents of one sidecar file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FolderMetadata {
    #[serde(default)]
    pub date: Option<DateHint>,
    #[serde(default)]
    pub place: Option<PlaceHint>,
}

impl FolderMetadata {
    /// Overlay `other` on top of `self`; fields `other` sets win.
    fn overlay(&mut self, other: &FolderMetadata) {
        if let Some(date) = &other.date {
            let merged = self.date.get_or_insert_with(DateHint::default);
            if date.not_earlier_than.is_some() {
                merged.not_earlier_than = date.not_earlier_than;
            }
            if date.not_later_than.is_some() {
                merged.not_later_than = date.not_later_than;
            }
        }
        if let Some(place) = &other.place {
            let merged = self.place.get_or_insert_with(PlaceHint::default);
            let levels = [
                (&mut merged.country, &place.country),
                (&mut merged.state, &place.state),
                (&mut merged.city, &place.city),
                (&mut merged.street, &place.street),
            ];
            for (target, value) in levels {
                if value.as_deref().is_some_and(|v| !v.trim().is_empty()) {
                    target.clone_from(value);
                }
            }
        }
    }
}

/// Parse `folder/folder.yaml`, `None` when the folder has no sidecar or it
/// is empty.
pub fn load_folder_yaml(folder: &Path) -> Result<Option<FolderMetadata>> {
    let path = folder.join(SIDECAR_NAME);
    if !path.is_file() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    let metadata: FolderMetadata =
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(metadata))
}

/// Merged sidecar metadata for a file: every `folder.yaml` from `root`
/// (inclusive) down to the file's folder, deeper folders overriding.
/// Without a root the walk continues to the filesystem root.
pub fn folder_metadata_for(file: &Path, root: Option<&Path>) -> Result<FolderMetadata> {
    let mut stack: Vec<(PathBuf, FolderMetadata)> = Vec::new();
    let mut folder = file.parent();
    while let Some(current) = folder {
        if let Some(metadata) = load_folder_yaml(current)? {
            stack.push((current.to_path_buf(), metadata));
        }
        if root.is_some_and(|r| r == current) {
            break;
        }
        folder = current.parent();
    }

    let mut merged = FolderMetadata::default();
    for (source, metadata) in stack.iter().rev() {
        debug!("Applying {}", source.join(SIDECAR_NAME).display());
        merged.overlay(metadata);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_leaf_overrides_root() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let leaf = root.join("1950s").join("summer");
        fs::create_dir_all(&leaf).unwrap();

        fs::write(
            root.join(SIDECAR_NAME),
            "date:\n  not_earlier_than: 1950-01-01\n  not_later_than: 1959-12-31\nplace:\n  country: Sweden\n  city: Uppsala\n",
        )
        .unwrap();
        fs::write(
            leaf.join(SIDECAR_NAME),
            "date:\n  not_earlier_than: 1955-06-01\nplace:\n  city: Stockholm\n  lat: 59.3\n",
        )
        .unwrap();

        let merged = folder_metadata_for(&leaf.join("img.jpg"), Some(root)).unwrap();
        let date = merged.date.unwrap();
        assert_eq!(date.not_earlier_than, NaiveDate::from_ymd_opt(1955, 6, 1));
        assert_eq!(date.not_later_than, NaiveDate::from_ymd_opt(1959, 12, 31));
        let place = merged.place.unwrap();
        assert_eq!(place.country.as_deref(), Some("Sweden"));
        assert_eq!(place.city.as_deref(), Some("Stockholm"));
        assert_eq!(place.state, None);
    }

    #[test]
    fn test_walk_stops_at_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("import");
        fs::create_dir_all(&root).unwrap();
        fs::write(dir.path().join(SIDECAR_NAME), "place:\n  country: Norway\n").unwrap();

        let merged = folder_metadata_for(&root.join("img.jpg"), Some(&root)).unwrap();
        assert_eq!(merged, FolderMetadata::default());
    }

    #[test]
    fn test_empty_and_malformed_sidecars() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(SIDECAR_NAME), "   \n").unwrap();
        assert_eq!(load_folder_yaml(dir.path()).unwrap(), None);

        fs::write(dir.path().join(SIDECAR_NAME), "date:\n  not_earlier_than: someday\n").unwrap();
        assert!(load_folder_yaml(dir.path()).is_err());
    }
}
