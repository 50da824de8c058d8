//! Error taxonomy for catalog operations.
//!
//! Business errors (`NotFound`, `Conflict`, `Validation`, `Forbidden`) are
//! scoped to the request that raised them and are never retried. Storage
//! faults are classified by [`crate::db::retry`] and only surface as
//! `Unavailable` once the retry budget is spent.

use thiserror::Error;

/// Result alias used throughout the catalog.
pub type Result<T, E = CatalogError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum CatalogError {
    /// Unknown photo, face, person, place, audit entry or embedding
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Duplicate person name, duplicate sibling place or a cluster id clash
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed input or an invariant the request would break
    #[error("invalid request: {0}")]
    Validation(String),

    /// The request carries no allow-listed editor identity
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("request cancelled")]
    Cancelled,

    /// Transient storage fault that outlived the retry budget
    #[error("storage unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// No pooled connection could be checked out in time
    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CatalogError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        CatalogError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CatalogError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CatalogError::Conflict(msg.into())
    }

    /// Stable machine-readable tag for the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            CatalogError::NotFound { .. } => "not_found",
            CatalogError::Conflict(_) => "conflict",
            CatalogError::Validation(_) => "validation",
            CatalogError::Forbidden(_) => "forbidden",
            CatalogError::Cancelled => "cancelled",
            CatalogError::Unavailable { .. } | CatalogError::Pool(_) => "unavailable",
            CatalogError::Storage(_) | CatalogError::Io(_) | CatalogError::Json(_) => "internal",
        }
    }

    /// True for errors the client caused and can correct.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CatalogError::NotFound { .. }
                | CatalogError::Conflict(_)
                | CatalogError::Validation(_)
                | CatalogError::Forbidden(_)
        )
    }
}

/// True when a rusqlite error is a UNIQUE constraint violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
