//! Append-only ledger of field-level photo changes.
//!
//! Entries are never updated or deleted (the schema enforces this with
//! triggers). Undoing a change is a new entry written through the normal
//! mutation path, see [`Database::revert`].

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::photos::photo_exists;
use super::{Database, RequestContext};
use crate::error::{CatalogError, Result};

/// Category of an audited change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    FacePerson,
    Place,
    Date,
    Quality,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::FacePerson => "face_person",
            FieldType::Place => "place",
            FieldType::Date => "date",
            FieldType::Quality => "quality",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "face_person" => Some(FieldType::FacePerson),
            "place" => Some(FieldType::Place),
            "date" => Some(FieldType::Date),
            "quality" => Some(FieldType::Quality),
            _ => None,
        }
    }
}

impl ToSql for FieldType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for FieldType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        FieldType::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown field type {:?}", s).into()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub photo_id: String,
    pub field_type: FieldType,
    pub field_key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_by: String,
    pub changed_at: DateTime<Utc>,
}

const ENTRY_COLUMNS: &str =
    "id, photo_id, field_type, field_key, old_value, new_value, changed_by, changed_at";

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get(0)?,
        photo_id: row.get(1)?,
        field_type: row.get(2)?,
        field_key: row.get(3)?,
        old_value: row.get(4)?,
        new_value: row.get(5)?,
        changed_by: row.get(6)?,
        changed_at: row.get(7)?,
    })
}

/// Record one field change. Call inside the transaction that applies it.
pub(crate) fn append(
    conn: &Connection,
    photo_id: &str,
    field_type: FieldType,
    field_key: &str,
    old_value: Option<&str>,
    new_value: Option<&str>,
    editor: &str,
) -> Result<i64> {
    if !photo_exists(conn, photo_id)? {
        return Err(CatalogError::not_found("photo", photo_id));
    }
    conn.execute(
        r#"
        INSERT INTO edit_history (photo_id, field_type, field_key, old_value, new_value, changed_by, changed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
        params![photo_id, field_type, field_key, old_value, new_value, editor, Utc::now()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Entries for a photo, most recent first.
pub(crate) fn history_of(conn: &Connection, photo_id: &str) -> Result<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM edit_history WHERE photo_id = ? ORDER BY changed_at DESC, id DESC",
        ENTRY_COLUMNS
    ))?;
    let entries = stmt
        .query_map([photo_id], row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

pub(crate) fn entry(conn: &Connection, entry_id: i64) -> Result<AuditEntry> {
    conn.query_row(
        &format!("SELECT {} FROM edit_history WHERE id = ?", ENTRY_COLUMNS),
        [entry_id],
        row_to_entry,
    )
    .optional()?
    .ok_or_else(|| CatalogError::not_found("audit entry", entry_id))
}

impl Database {
    /// Append an entry on behalf of the request's editor without touching
    /// the photo itself. Catalog mutations call [`append`] directly inside
    /// their own transaction instead.
    pub fn append_audit(
        &self,
        ctx: &RequestContext,
        photo_id: &str,
        field_type: FieldType,
        field_key: &str,
        old_value: Option<&str>,
        new_value: Option<&str>,
    ) -> Result<i64> {
        let editor = ctx.editor()?;
        self.store().write(ctx.cancel(), |tx| {
            append(tx, photo_id, field_type, field_key, old_value, new_value, editor)
        })
    }

    pub fn history_of(&self, ctx: &RequestContext, photo_id: &str) -> Result<Vec<AuditEntry>> {
        self.store().read(ctx.cancel(), |tx| {
            if !photo_exists(tx, photo_id)? {
                return Err(CatalogError::not_found("photo", photo_id));
            }
            history_of(tx, photo_id)
        })
    }

    pub fn audit_entry(&self, ctx: &RequestContext, entry_id: i64) -> Result<AuditEntry> {
        self.store().read(ctx.cancel(), |tx| entry(tx, entry_id))
    }
}
