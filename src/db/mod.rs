//! Catalog storage: the [`Database`] facade and the components behind it.
//!
//! Each submodule contributes an `impl Database` block for its part of the
//! query surface, plus connection-level helpers that other components call
//! from inside a shared transaction.

mod schema;
pub mod audit;
pub mod embeddings;
pub mod faces;
pub mod photos;
pub mod places;
pub mod query;
pub mod retry;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

use std::path::Path;

use tracing::{info, warn};

pub use audit::{AuditEntry, FieldType};
pub use embeddings::{SimilarPhoto, IMAGE_EMBEDDING_DIM};
pub use faces::{BoundingBox, ClusterFace, FaceCluster, Person, PersonSummary, PhotoFace, FACE_EMBEDDING_DIM};
pub use photos::{DateBounds, NewPhoto, Photo, PhotoDetail, PhotoUpdate, Visibility};
pub use places::{NewPlace, Place, PlaceHint, PlaceType};
pub use query::{Page, PageRequest, PhotoFilter};
pub use retry::{CancelToken, RetryPolicy};
pub use store::{Connector, SqliteConnector, Store};

use crate::config::{CatalogConfig, Config, StorageConfig};
use crate::error::{CatalogError, Result};

/// Per-request state: the resolved editor identity (if any) and the
/// caller's cancellation flag.
///
/// Editor identities can only be attached through
/// [`Database::request_for`], which enforces the allow-list.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    editor: Option<String>,
    cancel: CancelToken,
}

impl RequestContext {
    /// Replace the cancellation flag with one the caller controls.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel(&self) -> &CancelToken {
        &self.cancel
    }

    /// The editor identity, required by every mutation.
    pub fn editor(&self) -> Result<&str> {
        self.editor
            .as_deref()
            .ok_or_else(|| CatalogError::Forbidden("mutations require an editor identity".to_string()))
    }
}

pub struct Database {
    store: Store,
    settings: CatalogConfig,
    allowed_editors: Vec<String>,
}

impl Database {
    /// Open the catalog described by `config`.
    pub fn open(config: &Config) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let connector = SqliteConnector::new(&config.db_path, config.storage.busy_timeout());
        Self::with_connector(
            Box::new(connector),
            &config.storage,
            config.catalog,
            config.editors.allowed.clone(),
        )
    }

    pub fn with_connector(
        connector: Box<dyn Connector>,
        storage: &StorageConfig,
        settings: CatalogConfig,
        allowed_editors: Vec<String>,
    ) -> Result<Self> {
        let store = Store::open(connector, storage)?;
        Ok(Self {
            store,
            settings,
            allowed_editors,
        })
    }

    /// Open a SQLite file with default settings.
    pub fn open_path(path: &Path) -> Result<Self> {
        let config = Config {
            db_path: path.to_path_buf(),
            ..Config::default()
        };
        Self::open(&config)
    }

    pub fn initialize(&self) -> Result<()> {
        self.store
            .run(&CancelToken::new(), |conn| schema::initialize(conn))?;
        info!("Catalog schema ready");
        Ok(())
    }

    pub fn settings(&self) -> &CatalogConfig {
        &self.settings
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    /// Context for a read-only request.
    pub fn request(&self) -> RequestContext {
        RequestContext::default()
    }

    /// Context for a request on behalf of `identity`, as resolved by the
    /// upstream identity middleware.
    pub fn request_for(&self, identity: &str) -> Result<RequestContext> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(CatalogError::Forbidden("empty editor identity".to_string()));
        }
        if !self.allowed_editors.is_empty() && !self.allowed_editors.iter().any(|a| a == identity) {
            warn!("Rejected editor identity {:?}", identity);
            return Err(CatalogError::Forbidden(format!(
                "{} is not an allowed editor",
                identity
            )));
        }
        Ok(RequestContext {
            editor: Some(identity.to_string()),
            cancel: CancelToken::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::TestDb;
    use super::*;

    #[test]
    fn test_allow_list_enforced() {
        let t = TestDb::with_editors(vec!["alice".to_string()]);
        assert!(t.db.request_for("alice").is_ok());
        assert!(matches!(
            t.db.request_for("mallory"),
            Err(CatalogError::Forbidden(_))
        ));
        assert!(matches!(t.db.request_for("  "), Err(CatalogError::Forbidden(_))));
    }

    #[test]
    fn test_empty_allow_list_accepts_any_identity() {
        let t = TestDb::new();
        let ctx = t.db.request_for("bob").unwrap();
        assert_eq!(ctx.editor().unwrap(), "bob");
        assert!(t.db.request().editor().is_err());
    }
}
