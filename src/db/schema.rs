use rusqlite::Connection;
use tracing::{info, warn};

use crate::error::Result;

pub const SCHEMA: &str = r#"
-- Places: self-referencing hierarchy (country > state > city > street)
CREATE TABLE IF NOT EXISTS places (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name_primary TEXT NOT NULL,
    name_secondary TEXT NOT NULL,
    parent_id INTEGER REFERENCES places(id),
    place_type TEXT NOT NULL
);

-- Siblings never share a name in either language
CREATE UNIQUE INDEX IF NOT EXISTS idx_places_sibling_primary
    ON places(IFNULL(parent_id, 0), name_primary);
CREATE UNIQUE INDEX IF NOT EXISTS idx_places_sibling_secondary
    ON places(IFNULL(parent_id, 0), name_secondary);
CREATE INDEX IF NOT EXISTS idx_places_parent ON places(parent_id);

-- Photos: identity is the SHA-256 of the original file
CREATE TABLE IF NOT EXISTS photos (
    id TEXT PRIMARY KEY,
    original_filename TEXT NOT NULL,
    date_not_earlier_than TEXT,     -- YYYY-MM-DD
    date_not_later_than TEXT,       -- YYYY-MM-DD
    place_id INTEGER REFERENCES places(id),
    visibility TEXT NOT NULL DEFAULT 'visible',  -- visible / low_quality / deleted
    width INTEGER,
    height INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- EXIF passthrough, written at ingestion
CREATE TABLE IF NOT EXISTS photo_exif (
    photo_id TEXT PRIMARY KEY REFERENCES photos(id),
    exif_json TEXT NOT NULL
);

-- People: named individuals faces are assigned to
CREATE TABLE IF NOT EXISTS persons (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE,
    created_at TEXT NOT NULL
);

-- Faces: detections with bounding boxes, embeddings and cluster ids
CREATE TABLE IF NOT EXISTS faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id TEXT NOT NULL REFERENCES photos(id),
    person_id INTEGER REFERENCES persons(id),
    bbox_x INTEGER NOT NULL,
    bbox_y INTEGER NOT NULL,
    bbox_w INTEGER NOT NULL,
    bbox_h INTEGER NOT NULL,
    embedding BLOB NOT NULL,        -- 512 x float32, little endian
    cluster_id INTEGER              -- set once by the external clustering pass
);

CREATE INDEX IF NOT EXISTS idx_faces_photo ON faces(photo_id);
CREATE INDEX IF NOT EXISTS idx_faces_person ON faces(person_id);
CREATE INDEX IF NOT EXISTS idx_faces_unassigned_cluster
    ON faces(cluster_id) WHERE person_id IS NULL;

-- Whole-image embeddings for similarity ranking
CREATE TABLE IF NOT EXISTS image_embeddings (
    photo_id TEXT PRIMARY KEY REFERENCES photos(id),
    embedding BLOB NOT NULL,        -- 768 x float32, little endian
    embedding_dim INTEGER NOT NULL
);

-- Append-only audit ledger of field-level changes
CREATE TABLE IF NOT EXISTS edit_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id TEXT NOT NULL REFERENCES photos(id),
    field_type TEXT NOT NULL,       -- face_person / place / date / quality
    field_key TEXT NOT NULL,
    old_value TEXT,
    new_value TEXT,
    changed_by TEXT NOT NULL,
    changed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_edit_history_photo ON edit_history(photo_id, changed_at);

CREATE TRIGGER IF NOT EXISTS edit_history_no_update
BEFORE UPDATE ON edit_history
BEGIN
    SELECT RAISE(ABORT, 'edit_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS edit_history_no_delete
BEFORE DELETE ON edit_history
BEGIN
    SELECT RAISE(ABORT, 'edit_history is append-only');
END;
"#;

/// Columns added after the first deployment; `ADD COLUMN` when missing.
const BACKFILLED_COLUMNS: &[(&str, &str, &str)] = &[
    ("photos", "width", "INTEGER"),
    ("photos", "height", "INTEGER"),
];

/// Indexes on columns that may only exist once migrations have run.
const POST_MIGRATION_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_photos_visibility ON photos(visibility);
CREATE INDEX IF NOT EXISTS idx_photos_not_earlier_than ON photos(date_not_earlier_than);
CREATE INDEX IF NOT EXISTS idx_photos_place ON photos(place_id);
"#;

/// Create tables and bring an older database up to the current layout.
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    for (table, column, decl) in BACKFILLED_COLUMNS {
        ensure_column(conn, table, column, decl)?;
    }
    migrate_quality_flag(conn)?;
    conn.execute_batch(POST_MIGRATION_INDEXES)?;
    Ok(())
}

fn column_names(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    if !column_names(conn, table)?.iter().any(|c| c == column) {
        info!("Adding column {}.{}", table, column);
        conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))?;
    }
    Ok(())
}

/// Replace the boolean `is_low_quality` flag with the tri-state
/// `visibility` column. No-op on databases that never had the flag.
fn migrate_quality_flag(conn: &Connection) -> Result<()> {
    let columns = column_names(conn, "photos")?;
    if !columns.iter().any(|c| c == "is_low_quality") {
        return Ok(());
    }

    info!("Migrating photos.is_low_quality to photos.visibility");
    let has_visibility = columns.iter().any(|c| c == "visibility");

    conn.execute_batch("BEGIN IMMEDIATE")?;
    let migrated = (|| -> Result<()> {
        if !has_visibility {
            conn.execute_batch(
                "ALTER TABLE photos ADD COLUMN visibility TEXT NOT NULL DEFAULT 'visible'",
            )?;
        }
        conn.execute(
            r#"
            UPDATE photos
            SET visibility = 'low_quality'
            WHERE visibility = 'visible' AND is_low_quality
            "#,
            [],
        )?;
        conn.execute_batch("ALTER TABLE photos DROP COLUMN is_low_quality")?;
        Ok(())
    })();

    match migrated {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            Ok(())
        }
        Err(e) => {
            warn!("Quality flag migration failed, rolling back: {}", e);
            conn.execute_batch("ROLLBACK")?;
            Err(e)
        }
    }
}
