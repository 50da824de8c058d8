//! Filter and pagination types for photo listings, and the SQL predicate
//! they compose into.

use chrono::NaiveDate;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::config::CatalogConfig;
use crate::error::{CatalogError, Result};

/// Listing filter. Every part is optional; present parts are ANDed.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PhotoFilter {
    /// Inclusive start of the date window.
    pub date_start: Option<NaiveDate>,
    /// Inclusive end of the date window.
    pub date_end: Option<NaiveDate>,
    /// Match this place and everything below it.
    pub place_id: Option<i64>,
    /// Match photos with at least one face assigned to this person.
    pub person_id: Option<i64>,
    /// Also list photos marked low quality. Deleted photos are never listed.
    #[serde(default)]
    pub include_low_quality: bool,
}

impl PhotoFilter {
    pub fn has_date_window(&self) -> bool {
        self.date_start.is_some() || self.date_end.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.date_start, self.date_end) {
            if start > end {
                return Err(CatalogError::validation(format!(
                    "date window start {} is after end {}",
                    start, end
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
    /// 1-indexed page number.
    pub page: u32,
    /// Falls back to the configured default when absent.
    pub page_size: Option<u32>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: None,
        }
    }
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page,
            page_size: Some(page_size),
        }
    }

    /// Validate against the configured bounds, returning `(limit, offset)`.
    pub(crate) fn resolve(&self, settings: &CatalogConfig) -> Result<(u32, u64)> {
        if self.page < 1 {
            return Err(CatalogError::validation("page numbers start at 1"));
        }
        let size = self.page_size.unwrap_or(settings.default_page_size);
        if size < 1 || size > settings.max_page_size {
            return Err(CatalogError::validation(format!(
                "page size must be between 1 and {}",
                settings.max_page_size
            )));
        }
        Ok((size, u64::from(self.page - 1) * u64::from(size)))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: u64,
    pub page: u32,
    pub page_size: u32,
}

/// A WHERE clause over `photos p` with positional parameters.
#[derive(Debug, Default)]
pub(crate) struct Predicate {
    clauses: Vec<String>,
    pub(crate) params: Vec<Value>,
}

impl Predicate {
    /// Compose the listing predicate. `place_closure` is the already
    /// expanded place filter, if any.
    pub(crate) fn for_filter(filter: &PhotoFilter, place_closure: Option<&[i64]>) -> Self {
        let mut predicate = Predicate::default();

        if filter.include_low_quality {
            predicate.push("p.visibility IN ('visible', 'low_quality')", []);
        } else {
            predicate.push("p.visibility = 'visible'", []);
        }

        if filter.has_date_window() {
            predicate.push(
                "(p.date_not_earlier_than IS NOT NULL OR p.date_not_later_than IS NOT NULL)",
                [],
            );
        }
        if let Some(start) = filter.date_start {
            predicate.push(
                "(p.date_not_later_than IS NULL OR p.date_not_later_than >= ?)",
                [date_value(start)],
            );
        }
        if let Some(end) = filter.date_end {
            predicate.push(
                "(p.date_not_earlier_than IS NULL OR p.date_not_earlier_than <= ?)",
                [date_value(end)],
            );
        }

        if let Some(closure) = place_closure {
            if closure.is_empty() {
                predicate.push("0", []);
            } else {
                let placeholders = vec!["?"; closure.len()].join(", ");
                predicate.clauses.push(format!("p.place_id IN ({})", placeholders));
                predicate
                    .params
                    .extend(closure.iter().map(|id| Value::Integer(*id)));
            }
        }

        if let Some(person_id) = filter.person_id {
            predicate.push(
                "EXISTS (SELECT 1 FROM faces f WHERE f.photo_id = p.id AND f.person_id = ?)",
                [Value::Integer(person_id)],
            );
        }

        predicate
    }

    fn push<const N: usize>(&mut self, clause: &str, params: [Value; N]) {
        self.clauses.push(clause.to_string());
        self.params.extend(params);
    }

    pub(crate) fn to_sql(&self) -> String {
        if self.clauses.is_empty() {
            "1".to_string()
        } else {
            self.clauses.join(" AND ")
        }
    }
}

/// Listing order: dated photos newest first, undated last, then by filename.
pub(crate) const LISTING_ORDER: &str = "p.date_not_earlier_than IS NULL, p.date_not_earlier_than DESC, p.original_filename ASC, p.id ASC";

fn date_value(date: NaiveDate) -> Value {
    Value::Text(date.format("%Y-%m-%d").to_string())
}
