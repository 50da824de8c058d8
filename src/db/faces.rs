//! Faces, people and the unassigned-cluster review queue.
//!
//! Faces are written by the detection pipeline with a cluster id from the
//! external clustering pass. Editors then map whole clusters, or single
//! faces, to named people. Several clusters may map to the same person.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{info, warn};

use super::audit::{self, AuditEntry, FieldType};
use super::embeddings::{bytes_to_embedding, embedding_to_bytes};
use super::photos::{photo_exists, validate_photo_id};
use super::{Database, RequestContext};
use crate::error::{is_unique_violation, CatalogError, Result};

/// Face embedding dimension written by the detection pipeline.
pub const FACE_EMBEDDING_DIM: usize = 512;

/// Bounding box for a detected face
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Person {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A person with the number of faces assigned to them
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonSummary {
    pub id: i64,
    pub name: String,
    pub face_count: i64,
}

/// A face awaiting review inside a cluster
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterFace {
    pub face_id: i64,
    pub photo_id: String,
    pub bbox: BoundingBox,
    /// L2 norm of the embedding; higher means a more confident detection.
    pub quality: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceCluster {
    pub cluster_id: i64,
    pub face_count: usize,
    pub faces: Vec<ClusterFace>,
}

/// A face as shown in photo detail
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoFace {
    pub id: i64,
    pub bbox: BoundingBox,
    pub person_id: Option<i64>,
    pub person_name: Option<String>,
    pub cluster_id: Option<i64>,
}

fn row_to_bbox(row: &Row<'_>, first: usize) -> rusqlite::Result<BoundingBox> {
    Ok(BoundingBox {
        x: row.get(first)?,
        y: row.get(first + 1)?,
        width: row.get(first + 2)?,
        height: row.get(first + 3)?,
    })
}

pub(crate) fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

pub(crate) fn person_exists(conn: &Connection, person_id: i64) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM persons WHERE id = ?", [person_id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Faces on a photo with their resolved person names.
pub(crate) fn faces_for_photo(conn: &Connection, photo_id: &str) -> Result<Vec<PhotoFace>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT f.id, f.bbox_x, f.bbox_y, f.bbox_w, f.bbox_h, f.person_id, p.name, f.cluster_id
        FROM faces f
        LEFT JOIN persons p ON p.id = f.person_id
        WHERE f.photo_id = ?
        ORDER BY f.id
        "#,
    )?;
    let faces = stmt
        .query_map([photo_id], |row| {
            Ok(PhotoFace {
                id: row.get(0)?,
                bbox: row_to_bbox(row, 1)?,
                person_id: row.get(5)?,
                person_name: row.get(6)?,
                cluster_id: row.get(7)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(faces)
}

/// Point a face at `person_id` (or clear it) and audit the change against
/// the face's photo. Returns `None` when the face already has that person.
pub(crate) fn assign_in_tx(
    conn: &Connection,
    face_id: i64,
    person_id: Option<i64>,
    editor: &str,
) -> Result<Option<i64>> {
    let (photo_id, current): (String, Option<i64>) = conn
        .query_row(
            "SELECT photo_id, person_id FROM faces WHERE id = ?",
            [face_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| CatalogError::not_found("face", face_id))?;

    if let Some(id) = person_id {
        if !person_exists(conn, id)? {
            return Err(CatalogError::validation(format!("person {} does not exist", id)));
        }
    }
    if current == person_id {
        return Ok(None);
    }

    let entry_id = audit::append(
        conn,
        &photo_id,
        FieldType::FacePerson,
        &face_id.to_string(),
        current.map(|id| id.to_string()).as_deref(),
        person_id.map(|id| id.to_string()).as_deref(),
        editor,
    )?;
    conn.execute(
        "UPDATE faces SET person_id = ? WHERE id = ?",
        params![person_id, face_id],
    )?;
    Ok(Some(entry_id))
}

/// Undo a `face_person` entry by reassigning its previous person.
pub(crate) fn revert_assignment(conn: &Connection, entry: &AuditEntry, editor: &str) -> Result<Option<i64>> {
    let malformed = || CatalogError::validation(format!("entry {} is not a readable face assignment", entry.id));
    let face_id: i64 = entry.field_key.parse().map_err(|_| malformed())?;
    let previous = entry
        .old_value
        .as_deref()
        .map(|v| v.parse::<i64>().map_err(|_| malformed()))
        .transpose()?;
    assign_in_tx(conn, face_id, previous, editor)
}

fn get_person(conn: &Connection, person_id: i64) -> Result<Person> {
    conn.query_row(
        "SELECT id, name, created_at FROM persons WHERE id = ?",
        [person_id],
        |row| {
            Ok(Person {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| CatalogError::not_found("person", person_id))
}

impl Database {
    // ========================================================================
    // People
    // ========================================================================

    pub fn create_person(&self, ctx: &RequestContext, name: &str) -> Result<Person> {
        let editor = ctx.editor()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(CatalogError::validation("person name must not be blank"));
        }

        let person = self.store().write(ctx.cancel(), |tx| {
            let created_at = Utc::now();
            match tx.execute(
                "INSERT INTO persons (name, created_at) VALUES (?, ?)",
                params![name, created_at],
            ) {
                Ok(_) => Ok(Person {
                    id: tx.last_insert_rowid(),
                    name: name.to_string(),
                    created_at,
                }),
                Err(e) if is_unique_violation(&e) => {
                    Err(CatalogError::conflict(format!("person {:?} already exists", name)))
                }
                Err(e) => Err(e.into()),
            }
        })?;
        info!("{} created person {:?} (id {})", editor, person.name, person.id);
        Ok(person)
    }

    pub fn get_person(&self, ctx: &RequestContext, person_id: i64) -> Result<Person> {
        self.store().read(ctx.cancel(), |tx| get_person(tx, person_id))
    }

    /// All people with their assigned face counts, by name.
    pub fn list_persons(&self, ctx: &RequestContext) -> Result<Vec<PersonSummary>> {
        self.store().read(ctx.cancel(), |tx| {
            let mut stmt = tx.prepare(
                r#"
                SELECT p.id, p.name, COUNT(f.id) as face_count
                FROM persons p
                LEFT JOIN faces f ON f.person_id = p.id
                GROUP BY p.id
                ORDER BY p.name COLLATE NOCASE, p.id
                "#,
            )?;
            let persons = stmt
                .query_map([], |row| {
                    Ok(PersonSummary {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        face_count: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(persons)
        })
    }

    // ========================================================================
    // Cluster review
    // ========================================================================

    /// Clustered faces with no person yet, largest cluster first and the
    /// strongest detection first within each cluster. Faces on deleted
    /// photos are left out.
    pub fn unassigned_clusters(&self, ctx: &RequestContext) -> Result<Vec<FaceCluster>> {
        let rows = self.store().read(ctx.cancel(), |tx| {
            let mut stmt = tx.prepare(
                r#"
                SELECT f.cluster_id, f.id, f.photo_id, f.bbox_x, f.bbox_y, f.bbox_w, f.bbox_h, f.embedding
                FROM faces f
                JOIN photos p ON p.id = f.photo_id
                WHERE f.cluster_id IS NOT NULL
                  AND f.person_id IS NULL
                  AND p.visibility != 'deleted'
                "#,
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row_to_bbox(row, 3)?,
                        row.get::<_, Vec<u8>>(7)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut grouped: BTreeMap<i64, Vec<ClusterFace>> = BTreeMap::new();
        for (cluster_id, face_id, photo_id, bbox, blob) in rows {
            let quality = match bytes_to_embedding(&blob) {
                Some(embedding) => l2_norm(&embedding),
                None => {
                    warn!("Face {} has a malformed embedding", face_id);
                    0.0
                }
            };
            grouped.entry(cluster_id).or_default().push(ClusterFace {
                face_id,
                photo_id,
                bbox,
                quality,
            });
        }

        let mut clusters: Vec<FaceCluster> = grouped
            .into_iter()
            .map(|(cluster_id, mut faces)| {
                faces.sort_by(|a, b| b.quality.total_cmp(&a.quality).then(a.face_id.cmp(&b.face_id)));
                FaceCluster {
                    cluster_id,
                    face_count: faces.len(),
                    faces,
                }
            })
            .collect();
        clusters.sort_by(|a, b| b.face_count.cmp(&a.face_count).then(a.cluster_id.cmp(&b.cluster_id)));
        Ok(clusters)
    }

    /// Assign a face to a person, or unassign it with `None`. Returns the
    /// audit entry, or `None` if nothing changed.
    pub fn assign_face(&self, ctx: &RequestContext, face_id: i64, person_id: Option<i64>) -> Result<Option<i64>> {
        let editor = ctx.editor()?;
        let entry = self
            .store()
            .write(ctx.cancel(), |tx| assign_in_tx(tx, face_id, person_id, editor))?;
        if entry.is_some() {
            info!("{} set face {} to person {:?}", editor, face_id, person_id);
        }
        Ok(entry)
    }

    /// Assign every still-unassigned face of a cluster to one person, one
    /// audited assignment per face.
    pub fn assign_cluster(&self, ctx: &RequestContext, cluster_id: i64, person_id: i64) -> Result<Vec<i64>> {
        let editor = ctx.editor()?;
        let entries = self.store().write(ctx.cancel(), |tx| {
            if !person_exists(tx, person_id)? {
                return Err(CatalogError::validation(format!("person {} does not exist", person_id)));
            }
            let mut stmt = tx.prepare(
                r#"
                SELECT f.id FROM faces f
                JOIN photos p ON p.id = f.photo_id
                WHERE f.cluster_id = ? AND f.person_id IS NULL AND p.visibility != 'deleted'
                ORDER BY f.id
                "#,
            )?;
            let face_ids = stmt
                .query_map([cluster_id], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            if face_ids.is_empty() {
                return Err(CatalogError::not_found("cluster", cluster_id));
            }

            let mut entries = Vec::with_capacity(face_ids.len());
            for face_id in face_ids {
                entries.extend(assign_in_tx(tx, face_id, Some(person_id), editor)?);
            }
            Ok(entries)
        })?;
        info!(
            "{} assigned cluster {} ({} faces) to person {}",
            editor,
            cluster_id,
            entries.len(),
            person_id
        );
        Ok(entries)
    }

    // ========================================================================
    // Pipeline writes
    // ========================================================================

    /// Store a detected face
    pub fn store_face(
        &self,
        ctx: &RequestContext,
        photo_id: &str,
        bbox: &BoundingBox,
        embedding: &[f32],
        cluster_id: Option<i64>,
    ) -> Result<i64> {
        validate_photo_id(photo_id)?;
        if embedding.len() != FACE_EMBEDDING_DIM {
            return Err(CatalogError::validation(format!(
                "face embeddings have {} dimensions, got {}",
                FACE_EMBEDDING_DIM,
                embedding.len()
            )));
        }
        if bbox.width <= 0 || bbox.height <= 0 {
            return Err(CatalogError::validation("bounding box must have a positive size"));
        }

        let blob = embedding_to_bytes(embedding);
        self.store().write(ctx.cancel(), |tx| {
            if !photo_exists(tx, photo_id)? {
                return Err(CatalogError::not_found("photo", photo_id));
            }
            tx.execute(
                r#"
                INSERT INTO faces (photo_id, bbox_x, bbox_y, bbox_w, bbox_h, embedding, cluster_id)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
                params![photo_id, bbox.x, bbox.y, bbox.width, bbox.height, blob, cluster_id],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Record the clustering pass's verdict for a face. A cluster id never
    /// changes once set; returns `false` if it was already this cluster.
    pub fn set_face_cluster(&self, ctx: &RequestContext, face_id: i64, cluster_id: i64) -> Result<bool> {
        self.store().write(ctx.cancel(), |tx| {
            let current: Option<i64> = tx
                .query_row("SELECT cluster_id FROM faces WHERE id = ?", [face_id], |row| row.get(0))
                .optional()?
                .ok_or_else(|| CatalogError::not_found("face", face_id))?;
            match current {
                Some(existing) if existing == cluster_id => Ok(false),
                Some(existing) => Err(CatalogError::conflict(format!(
                    "face {} already belongs to cluster {}",
                    face_id, existing
                ))),
                None => {
                    tx.execute(
                        "UPDATE faces SET cluster_id = ? WHERE id = ?",
                        params![cluster_id, face_id],
                    )?;
                    Ok(true)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::TestDb;
    use crate::db::{PageRequest, PhotoFilter, PhotoUpdate, Visibility};

    #[test]
    fn test_clusters_ordered_by_size_then_norm() {
        let t = TestDb::new();
        let a = t.add_photo(1, "a.jpg", None, None, None);
        let b = t.add_photo(2, "b.jpg", None, None, None);

        let weak = t.add_face(&a, Some(7), 0.5);
        let strong = t.add_face(&b, Some(7), 3.0);
        let mid = t.add_face(&a, Some(7), 1.5);
        let lone = t.add_face(&b, Some(3), 9.0);
        t.add_face(&b, None, 1.0);

        let clusters = t.db.unassigned_clusters(&t.db.request()).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].cluster_id, 7);
        assert_eq!(clusters[0].face_count, 3);
        let order: Vec<_> = clusters[0].faces.iter().map(|f| f.face_id).collect();
        assert_eq!(order, vec![strong, mid, weak]);
        assert!(clusters[0]
            .faces
            .windows(2)
            .all(|w| w[0].quality >= w[1].quality));
        assert_eq!(clusters[1].faces[0].face_id, lone);
    }

    #[test]
    fn test_assigned_and_deleted_faces_leave_clusters() {
        let t = TestDb::new();
        let ctx = t.editor("alice");
        let a = t.add_photo(1, "a.jpg", None, None, None);
        let gone = t.add_photo(2, "b.jpg", None, None, None);
        let face = t.add_face(&a, Some(1), 1.0);
        let other = t.add_face(&a, Some(1), 2.0);
        t.add_face(&gone, Some(2), 1.0);

        let update = PhotoUpdate {
            visibility: Some(Visibility::Deleted),
            ..PhotoUpdate::default()
        };
        t.db.update_photo(&ctx, &gone, &update).unwrap();

        let alice = t.db.create_person(&ctx, "Alice").unwrap();
        t.db.assign_face(&ctx, face, Some(alice.id)).unwrap();

        let clusters = t.db.unassigned_clusters(&ctx).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].faces.len(), 1);
        assert_eq!(clusters[0].faces[0].face_id, other);
    }

    #[test]
    fn test_bob_in_two_clusters() {
        let t = TestDb::new();
        let ctx = t.editor("alice");
        let young = t.add_photo(1, "1960.jpg", Some("1960-01-01"), None, None);
        let old = t.add_photo(2, "1990.jpg", Some("1990-01-01"), None, None);
        t.add_face(&young, Some(1), 1.0);
        t.add_face(&young, Some(1), 1.2);
        t.add_face(&old, Some(2), 0.8);
        let bob = t.db.create_person(&ctx, "Bob").unwrap();

        let first = t.db.assign_cluster(&ctx, 1, bob.id).unwrap();
        let second = t.db.assign_cluster(&ctx, 2, bob.id).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(t.db.unassigned_clusters(&ctx).unwrap().is_empty());

        let persons = t.db.list_persons(&ctx).unwrap();
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].face_count, 3);

        let filter = PhotoFilter {
            person_id: Some(bob.id),
            ..PhotoFilter::default()
        };
        let page = t.db.list_photos(&ctx, &filter, PageRequest::default()).unwrap();
        assert_eq!(page.total_count, 2);

        assert!(matches!(
            t.db.assign_cluster(&ctx, 1, bob.id),
            Err(CatalogError::NotFound { kind: "cluster", .. })
        ));
    }

    #[test]
    fn test_assign_audits_and_unassign() {
        let t = TestDb::new();
        let ctx = t.editor("alice");
        let photo = t.add_photo(1, "a.jpg", None, None, None);
        let face = t.add_face(&photo, Some(1), 1.0);
        let carol = t.db.create_person(&ctx, "Carol").unwrap();

        let assigned = t.db.assign_face(&ctx, face, Some(carol.id)).unwrap().unwrap();
        assert_eq!(t.db.assign_face(&ctx, face, Some(carol.id)).unwrap(), None);
        let unassigned = t.db.assign_face(&ctx, face, None).unwrap().unwrap();

        let entry = t.db.audit_entry(&ctx, assigned).unwrap();
        assert_eq!(entry.field_type, FieldType::FacePerson);
        assert_eq!(entry.field_key, face.to_string());
        assert_eq!(entry.photo_id, photo);
        assert_eq!(entry.old_value, None);
        assert_eq!(entry.new_value, Some(carol.id.to_string()));

        let entry = t.db.audit_entry(&ctx, unassigned).unwrap();
        assert_eq!(entry.old_value, Some(carol.id.to_string()));
        assert_eq!(entry.new_value, None);

        let detail = t.db.get_photo(&ctx, &photo).unwrap();
        assert_eq!(detail.faces[0].person_id, None);
        assert_eq!(detail.history.len(), 2);
    }

    #[test]
    fn test_revert_face_assignment() {
        let t = TestDb::new();
        let ctx = t.editor("alice");
        let photo = t.add_photo(1, "a.jpg", None, None, None);
        let face = t.add_face(&photo, Some(1), 1.0);
        let dave = t.db.create_person(&ctx, "Dave").unwrap();

        let entry = t.db.assign_face(&ctx, face, Some(dave.id)).unwrap().unwrap();
        t.db.revert(&ctx, entry).unwrap().unwrap();

        let detail = t.db.get_photo(&ctx, &photo).unwrap();
        assert_eq!(detail.faces[0].person_id, None);
        assert_eq!(detail.faces[0].person_name, None);
        assert_eq!(t.db.unassigned_clusters(&ctx).unwrap().len(), 1);
    }

    #[test]
    fn test_assign_validation() {
        let t = TestDb::new();
        let ctx = t.editor("alice");
        let photo = t.add_photo(1, "a.jpg", None, None, None);
        let face = t.add_face(&photo, Some(1), 1.0);

        assert!(matches!(
            t.db.assign_face(&ctx, face, Some(404)),
            Err(CatalogError::Validation(_))
        ));
        assert!(matches!(
            t.db.assign_face(&ctx, face + 100, None),
            Err(CatalogError::NotFound { kind: "face", .. })
        ));
        assert!(matches!(
            t.db.assign_face(&t.db.request(), face, None),
            Err(CatalogError::Forbidden(_))
        ));
    }

    #[test]
    fn test_person_names_unique_ignoring_case() {
        let t = TestDb::new();
        let ctx = t.editor("alice");
        let eve = t.db.create_person(&ctx, "Eve").unwrap();
        assert!(matches!(t.db.create_person(&ctx, "eve"), Err(CatalogError::Conflict(_))));
        assert!(matches!(t.db.create_person(&ctx, "   "), Err(CatalogError::Validation(_))));
        assert_eq!(t.db.get_person(&ctx, eve.id).unwrap().name, "Eve");
        assert!(matches!(t.db.get_person(&ctx, 99), Err(CatalogError::NotFound { .. })));
    }

    #[test]
    fn test_pipeline_face_writes() {
        let t = TestDb::new();
        let ctx = t.db.request();
        let photo = t.add_photo(1, "a.jpg", None, None, None);
        let bbox = BoundingBox {
            x: 0,
            y: 0,
            width: 10,
            height: 10,
        };

        assert!(matches!(
            t.db.store_face(&ctx, &photo, &bbox, &[1.0; 3], None),
            Err(CatalogError::Validation(_))
        ));

        let face = t.add_face(&photo, None, 1.0);
        assert!(t.db.set_face_cluster(&ctx, face, 4).unwrap());
        assert!(!t.db.set_face_cluster(&ctx, face, 4).unwrap());
        assert!(matches!(
            t.db.set_face_cluster(&ctx, face, 5),
            Err(CatalogError::Conflict(_))
        ));
        assert!(matches!(
            t.db.set_face_cluster(&ctx, face + 1, 5),
            Err(CatalogError::NotFound { .. })
        ));
    }

    #[test]
    fn test_l2_norm() {
        assert_eq!(l2_norm(&[3.0, 4.0]), 5.0);
        assert_eq!(l2_norm(&[]), 0.0);
    }
}
