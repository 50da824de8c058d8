//! Photo records: listing, detail, field updates with audit, revert.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use super::audit::{self, AuditEntry, FieldType};
use super::faces::{self, PhotoFace};
use super::places::{place_exists, Place, PlaceTree};
use super::query::{Page, PageRequest, PhotoFilter, Predicate, LISTING_ORDER};
use super::{Database, RequestContext};
use crate::error::{CatalogError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Visible,
    LowQuality,
    Deleted,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Visible => "visible",
            Visibility::LowQuality => "low_quality",
            Visibility::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "visible" => Some(Visibility::Visible),
            "low_quality" => Some(Visibility::LowQuality),
            "deleted" => Some(Visibility::Deleted),
            _ => None,
        }
    }

    /// Map a value recorded against the old boolean quality flag.
    fn from_legacy_flag(value: Option<&str>) -> Option<Self> {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("true") | Some("1") => Some(Visibility::LowQuality),
            Some("false") | Some("0") | None => Some(Visibility::Visible),
            _ => None,
        }
    }
}

impl ToSql for Visibility {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Visibility {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Visibility::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown visibility {:?}", s).into()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Photo {
    pub id: String,
    pub original_filename: String,
    pub not_earlier_than: Option<NaiveDate>,
    pub not_later_than: Option<NaiveDate>,
    pub place_id: Option<i64>,
    pub visibility: Visibility,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A photo as the ingestion pipeline registers it.
#[derive(Debug, Clone, Default)]
pub struct NewPhoto {
    pub id: String,
    pub original_filename: String,
    pub not_earlier_than: Option<NaiveDate>,
    pub not_later_than: Option<NaiveDate>,
    pub place_id: Option<i64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub exif: Option<serde_json::Value>,
}

/// Field changes for [`Database::update_photo`]. `None` leaves a field
/// alone; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PhotoUpdate {
    #[serde(default, deserialize_with = "explicit_null")]
    pub not_earlier_than: Option<Option<NaiveDate>>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub not_later_than: Option<Option<NaiveDate>>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub place_id: Option<Option<i64>>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
}

impl PhotoUpdate {
    pub fn is_empty(&self) -> bool {
        self.not_earlier_than.is_none()
            && self.not_later_than.is_none()
            && self.place_id.is_none()
            && self.visibility.is_none()
    }
}

// A present `null` must deserialize to `Some(None)`, not `None`.
fn explicit_null<'de, T, D>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Serialize)]
pub struct PhotoDetail {
    pub photo: Photo,
    /// Root-first, empty when the photo has no place.
    pub place_chain: Vec<Place>,
    pub exif: Option<serde_json::Value>,
    pub faces: Vec<PhotoFace>,
    /// Most recent first.
    pub history: Vec<AuditEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateBounds {
    pub earliest: Option<NaiveDate>,
    pub latest: Option<NaiveDate>,
}

const PHOTO_COLUMNS: &str = "p.id, p.original_filename, p.date_not_earlier_than, p.date_not_later_than, p.place_id, p.visibility, p.width, p.height, p.created_at, p.updated_at";

fn row_to_photo(row: &Row<'_>) -> rusqlite::Result<Photo> {
    Ok(Photo {
        id: row.get(0)?,
        original_filename: row.get(1)?,
        not_earlier_than: row.get(2)?,
        not_later_than: row.get(3)?,
        place_id: row.get(4)?,
        visibility: row.get(5)?,
        width: row.get(6)?,
        height: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

/// Photo ids are the lowercase hex SHA-256 of the original file.
pub fn validate_photo_id(id: &str) -> Result<()> {
    let well_formed =
        id.len() == 64 && id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if well_formed {
        Ok(())
    } else {
        Err(CatalogError::validation(format!("malformed photo id {:?}", id)))
    }
}

pub(crate) fn photo_exists(conn: &Connection, id: &str) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM photos WHERE id = ?", [id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn get_photo(conn: &Connection, id: &str) -> Result<Photo> {
    conn.query_row(
        &format!("SELECT {} FROM photos p WHERE p.id = ?", PHOTO_COLUMNS),
        [id],
        row_to_photo,
    )
    .optional()?
    .ok_or_else(|| CatalogError::not_found("photo", id))
}

fn get_exif(conn: &Connection, id: &str) -> Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT exif_json FROM photo_exif WHERE photo_id = ?", [id], |row| row.get(0))
        .optional()?;
    match raw {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// One audited column of the photo record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhotoField {
    NotEarlierThan,
    NotLaterThan,
    Place,
    Visibility,
}

impl PhotoField {
    fn field_type(&self) -> FieldType {
        match self {
            PhotoField::NotEarlierThan | PhotoField::NotLaterThan => FieldType::Date,
            PhotoField::Place => FieldType::Place,
            PhotoField::Visibility => FieldType::Quality,
        }
    }

    fn key(&self) -> &'static str {
        match self {
            PhotoField::NotEarlierThan => "not_earlier_than",
            PhotoField::NotLaterThan => "not_later_than",
            PhotoField::Place => "place_id",
            PhotoField::Visibility => "visibility",
        }
    }

    fn column(&self) -> &'static str {
        match self {
            PhotoField::NotEarlierThan => "date_not_earlier_than",
            PhotoField::NotLaterThan => "date_not_later_than",
            PhotoField::Place => "place_id",
            PhotoField::Visibility => "visibility",
        }
    }
}

fn date_text(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

/// Diff `update` against the stored record and apply each changed field
/// with its audit entry. Returns the new entry ids in field order.
fn apply_update(conn: &Connection, photo_id: &str, update: &PhotoUpdate, editor: &str) -> Result<Vec<i64>> {
    let current = get_photo(conn, photo_id)?;

    let not_earlier_than = update.not_earlier_than.unwrap_or(current.not_earlier_than);
    let not_later_than = update.not_later_than.unwrap_or(current.not_later_than);
    if let (Some(start), Some(end)) = (not_earlier_than, not_later_than) {
        if start > end {
            return Err(CatalogError::validation(format!(
                "not_earlier_than {} is after not_later_than {}",
                start, end
            )));
        }
    }

    let place_id = update.place_id.unwrap_or(current.place_id);
    if place_id != current.place_id {
        if let Some(id) = place_id {
            if !place_exists(conn, id)? {
                return Err(CatalogError::validation(format!("place {} does not exist", id)));
            }
        }
    }

    let visibility = update.visibility.unwrap_or(current.visibility);

    let mut changes: Vec<(PhotoField, Option<String>, Option<String>, Value)> = Vec::new();
    if not_earlier_than != current.not_earlier_than {
        let new = date_text(not_earlier_than);
        changes.push((
            PhotoField::NotEarlierThan,
            date_text(current.not_earlier_than),
            new.clone(),
            new.map_or(Value::Null, Value::Text),
        ));
    }
    if not_later_than != current.not_later_than {
        let new = date_text(not_later_than);
        changes.push((
            PhotoField::NotLaterThan,
            date_text(current.not_later_than),
            new.clone(),
            new.map_or(Value::Null, Value::Text),
        ));
    }
    if place_id != current.place_id {
        changes.push((
            PhotoField::Place,
            current.place_id.map(|id| id.to_string()),
            place_id.map(|id| id.to_string()),
            place_id.map_or(Value::Null, Value::Integer),
        ));
    }
    if visibility != current.visibility {
        changes.push((
            PhotoField::Visibility,
            Some(current.visibility.as_str().to_string()),
            Some(visibility.as_str().to_string()),
            Value::Text(visibility.as_str().to_string()),
        ));
    }

    let mut entry_ids = Vec::with_capacity(changes.len());
    for (field, old, new, value) in &changes {
        entry_ids.push(audit::append(
            conn,
            photo_id,
            field.field_type(),
            field.key(),
            old.as_deref(),
            new.as_deref(),
            editor,
        )?);
        conn.execute(
            &format!("UPDATE photos SET {} = ?, updated_at = ? WHERE id = ?", field.column()),
            params![value, Utc::now(), photo_id],
        )?;
    }
    Ok(entry_ids)
}

/// The update that restores the value an entry replaced.
fn reverting_update(entry: &AuditEntry) -> Result<PhotoUpdate> {
    let malformed = || {
        CatalogError::validation(format!(
            "entry {} holds an unreadable {} value",
            entry.id, entry.field_key
        ))
    };
    let old = entry.old_value.as_deref();
    let parse_date = |value: Option<&str>| -> Result<Option<NaiveDate>> {
        value
            .map(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").map_err(|_| malformed()))
            .transpose()
    };

    let mut update = PhotoUpdate::default();
    match (entry.field_type, entry.field_key.as_str()) {
        (FieldType::Date, "not_earlier_than") => update.not_earlier_than = Some(parse_date(old)?),
        (FieldType::Date, "not_later_than") => update.not_later_than = Some(parse_date(old)?),
        (FieldType::Place, "place_id") => {
            update.place_id = Some(old.map(|v| v.parse::<i64>().map_err(|_| malformed())).transpose()?)
        }
        (FieldType::Quality, "visibility") => {
            update.visibility = Some(old.and_then(Visibility::parse).ok_or_else(malformed)?)
        }
        (FieldType::Quality, "is_low_quality") => {
            update.visibility = Some(Visibility::from_legacy_flag(old).ok_or_else(malformed)?)
        }
        (field_type, key) => {
            return Err(CatalogError::validation(format!(
                "entry {} has an unknown field {}/{}",
                entry.id,
                field_type.as_str(),
                key
            )))
        }
    }
    Ok(update)
}

impl Database {
    /// One page of photos matching `filter`, plus the total match count.
    pub fn list_photos(
        &self,
        ctx: &RequestContext,
        filter: &PhotoFilter,
        page: PageRequest,
    ) -> Result<Page<Photo>> {
        filter.validate()?;
        let (limit, offset) = page.resolve(self.settings())?;

        self.store().read(ctx.cancel(), |tx| {
            let closure = match filter.place_id {
                Some(place_id) => Some(
                    PlaceTree::load(tx)?
                        .descendants_of(place_id)?
                        .into_iter()
                        .collect::<Vec<_>>(),
                ),
                None => None,
            };
            if let Some(person_id) = filter.person_id {
                if !faces::person_exists(tx, person_id)? {
                    return Err(CatalogError::not_found("person", person_id));
                }
            }

            let predicate = Predicate::for_filter(filter, closure.as_deref());
            let where_sql = predicate.to_sql();
            debug!("Listing photos WHERE {}", where_sql);

            let total_count: i64 = tx.query_row(
                &format!("SELECT COUNT(*) FROM photos p WHERE {}", where_sql),
                params_from_iter(predicate.params.iter()),
                |row| row.get(0),
            )?;

            let mut page_params = predicate.params.clone();
            page_params.push(Value::Integer(i64::from(limit)));
            page_params.push(Value::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM photos p WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
                PHOTO_COLUMNS, where_sql, LISTING_ORDER
            ))?;
            let items = stmt
                .query_map(params_from_iter(page_params.iter()), row_to_photo)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(Page {
                items,
                total_count: total_count as u64,
                page: page.page,
                page_size: limit,
            })
        })
    }

    /// The photo with its place chain, EXIF, faces and history. Deleted
    /// photos are still returned.
    pub fn get_photo(&self, ctx: &RequestContext, photo_id: &str) -> Result<PhotoDetail> {
        validate_photo_id(photo_id)?;
        self.store().read(ctx.cancel(), |tx| {
            let photo = get_photo(tx, photo_id)?;
            let place_chain = match photo.place_id {
                Some(place_id) => PlaceTree::load(tx)?.chain(place_id)?,
                None => Vec::new(),
            };
            Ok(PhotoDetail {
                exif: get_exif(tx, photo_id)?,
                faces: faces::faces_for_photo(tx, photo_id)?,
                history: audit::history_of(tx, photo_id)?,
                place_chain,
                photo,
            })
        })
    }

    /// Apply field changes as the request's editor. Each field that
    /// actually changes gets one audit entry; unchanged fields are skipped.
    pub fn update_photo(&self, ctx: &RequestContext, photo_id: &str, update: &PhotoUpdate) -> Result<Vec<i64>> {
        let editor = ctx.editor()?;
        validate_photo_id(photo_id)?;
        let entry_ids = self
            .store()
            .write(ctx.cancel(), |tx| apply_update(tx, photo_id, update, editor))?;
        if !entry_ids.is_empty() {
            info!("{} changed {} field(s) of photo {}", editor, entry_ids.len(), photo_id);
        }
        Ok(entry_ids)
    }

    /// Undo an audit entry by writing its old value back through the normal
    /// update path. Returns the new entry, or `None` when the field already
    /// holds that value.
    pub fn revert(&self, ctx: &RequestContext, entry_id: i64) -> Result<Option<i64>> {
        let editor = ctx.editor()?;
        let reverted = self.store().write(ctx.cancel(), |tx| {
            let entry = audit::entry(tx, entry_id)?;
            if entry.field_type == FieldType::FacePerson {
                return faces::revert_assignment(tx, &entry, editor);
            }
            let update = reverting_update(&entry)?;
            Ok(apply_update(tx, &entry.photo_id, &update, editor)?.into_iter().next())
        })?;
        match reverted {
            Some(new_entry) => info!("{} reverted entry {} as {}", editor, entry_id, new_entry),
            None => debug!("Entry {} already reverted", entry_id),
        }
        Ok(reverted)
    }

    /// Earliest and latest known dates over photos that are not deleted.
    pub fn date_bounds(&self, ctx: &RequestContext) -> Result<DateBounds> {
        self.store().read(ctx.cancel(), |tx| {
            let bounds = tx.query_row(
                r#"
                SELECT MIN(COALESCE(date_not_earlier_than, date_not_later_than)),
                       MAX(COALESCE(date_not_later_than, date_not_earlier_than))
                FROM photos
                WHERE visibility != 'deleted'
                "#,
                [],
                |row| {
                    Ok(DateBounds {
                        earliest: row.get(0)?,
                        latest: row.get(1)?,
                    })
                },
            )?;
            Ok(bounds)
        })
    }

    /// Record a photo written by the ingestion pipeline. Returns `false`
    /// when the content hash is already catalogued.
    pub fn register_photo(&self, ctx: &RequestContext, photo: &NewPhoto) -> Result<bool> {
        validate_photo_id(&photo.id)?;
        if photo.original_filename.trim().is_empty() {
            return Err(CatalogError::validation("original filename must not be blank"));
        }
        if let (Some(start), Some(end)) = (photo.not_earlier_than, photo.not_later_than) {
            if start > end {
                return Err(CatalogError::validation(format!(
                    "not_earlier_than {} is after not_later_than {}",
                    start, end
                )));
            }
        }
        let exif_json = photo.exif.as_ref().map(serde_json::to_string).transpose()?;

        let created = self.store().write(ctx.cancel(), |tx| {
            if let Some(place_id) = photo.place_id {
                if !place_exists(tx, place_id)? {
                    return Err(CatalogError::validation(format!("place {} does not exist", place_id)));
                }
            }
            let now = Utc::now();
            let inserted = tx.execute(
                r#"
                INSERT INTO photos (id, original_filename, date_not_earlier_than, date_not_later_than,
                                    place_id, visibility, width, height, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, 'visible', ?, ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
                "#,
                params![
                    photo.id,
                    photo.original_filename,
                    photo.not_earlier_than,
                    photo.not_later_than,
                    photo.place_id,
                    photo.width,
                    photo.height,
                    now,
                    now,
                ],
            )?;
            if inserted == 0 {
                return Ok(false);
            }
            if let Some(json) = &exif_json {
                tx.execute(
                    "INSERT OR REPLACE INTO photo_exif (photo_id, exif_json) VALUES (?, ?)",
                    params![photo.id, json],
                )?;
            }
            Ok(true)
        })?;

        if created {
            info!("Registered photo {} ({})", photo.id, photo.original_filename);
        }
        Ok(created)
    }

    /// Fill in missing dimensions for an already registered photo.
    pub fn backfill_dimensions(&self, ctx: &RequestContext, photo_id: &str, width: u32, height: u32) -> Result<bool> {
        validate_photo_id(photo_id)?;
        let updated = self.store().write(ctx.cancel(), |tx| {
            let changed = tx.execute(
                r#"
                UPDATE photos SET width = ?, height = ?
                WHERE id = ? AND (width IS NULL OR height IS NULL)
                "#,
                params![width, height, photo_id],
            )?;
            Ok(changed > 0)
        })?;
        if updated {
            debug!("Backfilled dimensions {}x{} for {}", width, height, photo_id);
        }
        Ok(updated)
    }
}
