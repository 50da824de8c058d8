//! Fixtures shared by the catalog tests: a throwaway SQLite file plus
//! helpers for the rows the ingestion pipeline would normally write.

use chrono::NaiveDate;
use tempfile::TempDir;

use super::{
    BoundingBox, Database, NewPhoto, NewPlace, PlaceType, RequestContext, SqliteConnector,
    FACE_EMBEDDING_DIM, IMAGE_EMBEDDING_DIM,
};
use crate::config::{CatalogConfig, StorageConfig};

pub struct TestDb {
    pub db: Database,
    _dir: TempDir,
}

impl TestDb {
    pub fn new() -> Self {
        Self::with_editors(Vec::new())
    }

    pub fn with_editors(allowed: Vec<String>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            ..StorageConfig::default()
        };
        let connector = SqliteConnector::new(dir.path().join("catalog.db"), storage.busy_timeout());
        let db = Database::with_connector(Box::new(connector), &storage, CatalogConfig::default(), allowed)
            .unwrap();
        db.initialize().unwrap();
        Self { db, _dir: dir }
    }

    pub fn editor(&self, name: &str) -> RequestContext {
        self.db.request_for(name).unwrap()
    }

    pub fn add_photo(
        &self,
        n: u32,
        filename: &str,
        not_earlier_than: Option<&str>,
        not_later_than: Option<&str>,
        place_id: Option<i64>,
    ) -> String {
        let id = photo_id(n);
        let photo = NewPhoto {
            id: id.clone(),
            original_filename: filename.to_string(),
            not_earlier_than: not_earlier_than.map(date),
            not_later_than: not_later_than.map(date),
            place_id,
            width: None,
            height: None,
            exif: None,
        };
        assert!(self.db.register_photo(&self.db.request(), &photo).unwrap());
        id
    }

    pub fn add_place(&self, name: &str, parent_id: Option<i64>, place_type: PlaceType) -> i64 {
        let ctx = self.editor("fixture");
        self.db
            .create_place(
                &ctx,
                &NewPlace {
                    name_primary: name.to_string(),
                    name_secondary: name.to_string(),
                    parent_id,
                    place_type,
                },
            )
            .unwrap()
            .id
    }

    /// Store a face whose embedding has L2 norm `norm`.
    pub fn add_face(&self, photo_id: &str, cluster_id: Option<i64>, norm: f32) -> i64 {
        let mut embedding = vec![0.0f32; FACE_EMBEDDING_DIM];
        embedding[0] = norm;
        self.db
            .store_face(
                &self.db.request(),
                photo_id,
                &BoundingBox {
                    x: 10,
                    y: 20,
                    width: 30,
                    height: 40,
                },
                &embedding,
                cluster_id,
            )
            .unwrap()
    }

    /// Store an image embedding pointing along `direction` in the first
    /// few dimensions.
    pub fn add_embedding(&self, photo_id: &str, direction: &[f32]) {
        let mut embedding = vec![0.0f32; IMAGE_EMBEDDING_DIM];
        embedding[..direction.len()].copy_from_slice(direction);
        self.db
            .store_image_embedding(&self.db.request(), photo_id, &embedding)
            .unwrap();
    }
}

pub fn photo_id(n: u32) -> String {
    format!("{:064x}", n)
}

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}
