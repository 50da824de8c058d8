//! Image embedding storage and similarity ranking.

use rayon::prelude::*;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::{debug, warn};

use super::photos::{photo_exists, validate_photo_id};
use super::{Database, RequestContext};
use crate::error::{CatalogError, Result};

/// Image embedding dimension written by the embedding pipeline.
pub const IMAGE_EMBEDDING_DIM: usize = 768;

/// Search result with cosine distance from the source photo
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarPhoto {
    pub photo_id: String,
    pub distance: f32,
}

impl Database {
    /// Store an embedding for a photo, replacing any earlier one.
    pub fn store_image_embedding(&self, ctx: &RequestContext, photo_id: &str, embedding: &[f32]) -> Result<()> {
        validate_photo_id(photo_id)?;
        if embedding.len() != IMAGE_EMBEDDING_DIM {
            return Err(CatalogError::validation(format!(
                "image embeddings have {} dimensions, got {}",
                IMAGE_EMBEDDING_DIM,
                embedding.len()
            )));
        }

        let bytes = embedding_to_bytes(embedding);
        self.store().write(ctx.cancel(), |tx| {
            if !photo_exists(tx, photo_id)? {
                return Err(CatalogError::not_found("photo", photo_id));
            }
            tx.execute(
                r#"
                INSERT OR REPLACE INTO image_embeddings (photo_id, embedding, embedding_dim)
                VALUES (?, ?, ?)
                "#,
                params![photo_id, bytes, embedding.len() as i64],
            )?;
            Ok(())
        })
    }

    /// The `limit` photos closest to `photo_id` by cosine distance, nearest
    /// first. Deleted photos and the source itself are never returned.
    pub fn similar_to(&self, ctx: &RequestContext, photo_id: &str, limit: usize) -> Result<Vec<SimilarPhoto>> {
        validate_photo_id(photo_id)?;
        let max = self.settings().max_similar_results;
        if limit < 1 || limit > max {
            return Err(CatalogError::validation(format!(
                "limit must be between 1 and {}",
                max
            )));
        }

        let (source, candidates) = self.store().read(ctx.cancel(), |tx| {
            let source: Vec<u8> = tx
                .query_row(
                    "SELECT embedding FROM image_embeddings WHERE photo_id = ?",
                    [photo_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| CatalogError::not_found("embedding", photo_id))?;

            let mut stmt = tx.prepare(
                r#"
                SELECT e.photo_id, e.embedding
                FROM image_embeddings e
                JOIN photos p ON p.id = e.photo_id
                WHERE e.photo_id != ? AND p.visibility != 'deleted'
                "#,
            )?;
            let candidates = stmt
                .query_map([photo_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok((source, candidates))
        })?;

        let source = bytes_to_embedding(&source).ok_or_else(|| {
            CatalogError::validation(format!("embedding for {} is malformed", photo_id))
        })?;
        debug!("Ranking {} candidates against {}", candidates.len(), photo_id);
        Ok(rank_by_distance(&source, candidates, limit))
    }
}

/// Exact linear scan: distance to every candidate, ascending, ties broken
/// by photo id. Candidates whose dimension differs from the source are
/// skipped.
pub(crate) fn rank_by_distance(source: &[f32], candidates: Vec<(String, Vec<u8>)>, limit: usize) -> Vec<SimilarPhoto> {
    let mut ranked: Vec<SimilarPhoto> = candidates
        .into_par_iter()
        .filter_map(|(photo_id, bytes)| {
            let embedding = bytes_to_embedding(&bytes)?;
            if embedding.len() != source.len() {
                warn!("Skipping {}: embedding has {} dimensions", photo_id, embedding.len());
                return None;
            }
            Some(SimilarPhoto {
                distance: cosine_distance(source, &embedding),
                photo_id,
            })
        })
        .collect();

    ranked.par_sort_unstable_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.photo_id.cmp(&b.photo_id)));
    ranked.truncate(limit);
    ranked
}

/// Calculate cosine similarity between two vectors
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

pub(crate) fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

// ============================================================================
// Helper functions
// ============================================================================

/// Convert f32 slice to little-endian bytes for storage
pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert stored bytes back to an f32 vector, `None` if the length is not
/// a whole number of floats
pub(crate) fn bytes_to_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}
