//! Photo catalog and provenance engine: filtered browsing over a photo
//! archive, collaborative metadata correction with an append-only audit
//! trail, face-cluster review and visual similarity ranking.

pub mod blob;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod logging;

pub use error::{CatalogError, Result};
