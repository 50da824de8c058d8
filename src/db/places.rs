//! Place hierarchy: a forest of named locations (country > state > city >
//! street) and the "place plus all descendants" closure used by filters.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Database, RequestContext};
use crate::error::{is_unique_violation, CatalogError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaceType {
    Country,
    State,
    City,
    Street,
}

impl PlaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaceType::Country => "country",
            PlaceType::State => "state",
            PlaceType::City => "city",
            PlaceType::Street => "street",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "country" => Some(PlaceType::Country),
            "state" => Some(PlaceType::State),
            "city" => Some(PlaceType::City),
            "street" => Some(PlaceType::Street),
            _ => None,
        }
    }

    /// Position in the hierarchy, 0 for countries.
    pub fn depth(&self) -> u8 {
        match self {
            PlaceType::Country => 0,
            PlaceType::State => 1,
            PlaceType::City => 2,
            PlaceType::Street => 3,
        }
    }
}

impl ToSql for PlaceType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for PlaceType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        PlaceType::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown place type {:?}", s).into()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Place {
    pub id: i64,
    pub name_primary: String,
    pub name_secondary: String,
    pub parent_id: Option<i64>,
    pub place_type: PlaceType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPlace {
    pub name_primary: String,
    pub name_secondary: String,
    pub parent_id: Option<i64>,
    pub place_type: PlaceType,
}

/// Named place levels attached to a photo at ingestion time.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PlaceHint {
    pub country: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
    pub street: Option<String>,
}

impl PlaceHint {
    pub fn is_empty(&self) -> bool {
        self.levels().next().is_none()
    }

    /// Non-blank levels, root first.
    fn levels(&self) -> impl Iterator<Item = (PlaceType, &str)> {
        [
            (PlaceType::Country, &self.country),
            (PlaceType::State, &self.state),
            (PlaceType::City, &self.city),
            (PlaceType::Street, &self.street),
        ]
        .into_iter()
        .filter_map(|(place_type, name)| {
            name.as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(|n| (place_type, n))
        })
    }
}

const PLACE_COLUMNS: &str = "id, name_primary, name_secondary, parent_id, place_type";

fn row_to_place(row: &Row<'_>) -> rusqlite::Result<Place> {
    Ok(Place {
        id: row.get(0)?,
        name_primary: row.get(1)?,
        name_secondary: row.get(2)?,
        parent_id: row.get(3)?,
        place_type: row.get(4)?,
    })
}

/// In-memory arena over the whole places table.
pub(crate) struct PlaceTree {
    nodes: HashMap<i64, Place>,
    children: HashMap<i64, Vec<i64>>,
}

impl PlaceTree {
    pub(crate) fn load(conn: &Connection) -> Result<Self> {
        let mut stmt = conn.prepare(&format!("SELECT {} FROM places", PLACE_COLUMNS))?;
        let places = stmt
            .query_map([], row_to_place)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Self::from_places(places))
    }

    pub(crate) fn from_places(places: Vec<Place>) -> Self {
        let mut children: HashMap<i64, Vec<i64>> = HashMap::new();
        for place in &places {
            if let Some(parent) = place.parent_id {
                children.entry(parent).or_default().push(place.id);
            }
        }
        let nodes = places.into_iter().map(|p| (p.id, p)).collect();
        Self { nodes, children }
    }

    /// The place itself plus every transitive descendant.
    pub(crate) fn descendants_of(&self, id: i64) -> Result<BTreeSet<i64>> {
        if !self.nodes.contains_key(&id) {
            return Err(CatalogError::not_found("place", id));
        }

        let mut closure = BTreeSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            // A node seen twice means the parent links loop; skip it.
            if !closure.insert(current) {
                continue;
            }
            if let Some(kids) = self.children.get(&current) {
                queue.extend(kids.iter().copied());
            }
        }
        Ok(closure)
    }

    /// Ancestors of `id` and the place itself, root first.
    pub(crate) fn chain(&self, id: i64) -> Result<Vec<Place>> {
        let mut current = self
            .nodes
            .get(&id)
            .ok_or_else(|| CatalogError::not_found("place", id))?;

        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        loop {
            if !seen.insert(current.id) {
                warn!("Place {} has a cyclic parent chain", id);
                break;
            }
            chain.push(current.clone());
            match current.parent_id.and_then(|p| self.nodes.get(&p)) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        chain.reverse();
        Ok(chain)
    }
}

pub(crate) fn get_place(conn: &Connection, id: i64) -> Result<Option<Place>> {
    let place = conn
        .query_row(
            &format!("SELECT {} FROM places WHERE id = ?", PLACE_COLUMNS),
            [id],
            row_to_place,
        )
        .optional()?;
    Ok(place)
}

pub(crate) fn place_exists(conn: &Connection, id: i64) -> Result<bool> {
    Ok(get_place(conn, id)?.is_some())
}

fn insert_place(conn: &Connection, new: &NewPlace) -> Result<Place> {
    let name_primary = new.name_primary.trim();
    let name_secondary = new.name_secondary.trim();
    if name_primary.is_empty() || name_secondary.is_empty() {
        return Err(CatalogError::validation("place names must not be blank"));
    }

    if let Some(parent_id) = new.parent_id {
        let parent = get_place(conn, parent_id)?
            .ok_or_else(|| CatalogError::not_found("place", parent_id))?;
        if parent.place_type.depth() >= new.place_type.depth() {
            return Err(CatalogError::validation(format!(
                "a {} cannot be placed under a {}",
                new.place_type.as_str(),
                parent.place_type.as_str()
            )));
        }
    }

    let inserted = conn.execute(
        r#"
        INSERT INTO places (name_primary, name_secondary, parent_id, place_type)
        VALUES (?, ?, ?, ?)
        "#,
        params![name_primary, name_secondary, new.parent_id, new.place_type],
    );
    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            return Err(CatalogError::conflict(format!(
                "a sibling place named {:?} already exists",
                name_primary
            )));
        }
        Err(e) => return Err(e.into()),
    }

    Ok(Place {
        id: conn.last_insert_rowid(),
        name_primary: name_primary.to_string(),
        name_secondary: name_secondary.to_string(),
        parent_id: new.parent_id,
        place_type: new.place_type,
    })
}

fn find_child(conn: &Connection, parent_id: Option<i64>, name: &str) -> Result<Option<Place>> {
    let place = conn
        .query_row(
            &format!(
                "SELECT {} FROM places WHERE parent_id IS ?1 AND (name_primary = ?2 OR name_secondary = ?2)",
                PLACE_COLUMNS
            ),
            params![parent_id, name],
            row_to_place,
        )
        .optional()?;
    Ok(place)
}

/// Find or create each level of `hint` under the previous one and return
/// the deepest place, or `None` for an empty hint.
pub(crate) fn ensure_path(conn: &Connection, hint: &PlaceHint) -> Result<Option<i64>> {
    let mut parent: Option<i64> = None;
    for (place_type, name) in hint.levels() {
        let id = match find_child(conn, parent, name)? {
            Some(existing) => existing.id,
            None => {
                let created = insert_place(
                    conn,
                    &NewPlace {
                        name_primary: name.to_string(),
                        name_secondary: name.to_string(),
                        parent_id: parent,
                        place_type,
                    },
                )?;
                info!("Created {} {:?} (id {})", place_type.as_str(), name, created.id);
                created.id
            }
        };
        parent = Some(id);
    }
    Ok(parent)
}

impl Database {
    /// `place_id` and all of its transitive descendants.
    pub fn descendants_of(&self, ctx: &RequestContext, place_id: i64) -> Result<BTreeSet<i64>> {
        self.store()
            .read(ctx.cancel(), |tx| PlaceTree::load(tx)?.descendants_of(place_id))
    }

    /// The place and its ancestors, root first.
    pub fn place_chain(&self, ctx: &RequestContext, place_id: i64) -> Result<Vec<Place>> {
        self.store()
            .read(ctx.cancel(), |tx| PlaceTree::load(tx)?.chain(place_id))
    }

    pub fn list_places(&self, ctx: &RequestContext) -> Result<Vec<Place>> {
        self.store().read(ctx.cancel(), |tx| {
            let mut stmt = tx.prepare(&format!(
                r#"
                SELECT {} FROM places
                ORDER BY CASE place_type
                    WHEN 'country' THEN 0
                    WHEN 'state' THEN 1
                    WHEN 'city' THEN 2
                    ELSE 3
                END, name_primary, id
                "#,
                PLACE_COLUMNS
            ))?;
            let places = stmt
                .query_map([], row_to_place)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(places)
        })
    }

    pub fn create_place(&self, ctx: &RequestContext, new: &NewPlace) -> Result<Place> {
        let editor = ctx.editor()?;
        let place = self.store().write(ctx.cancel(), |tx| insert_place(tx, new))?;
        info!("{} created place {:?} (id {})", editor, place.name_primary, place.id);
        Ok(place)
    }

    /// Find or create the place chain named by an ingestion hint.
    pub fn ensure_place_path(&self, ctx: &RequestContext, hint: &PlaceHint) -> Result<Option<i64>> {
        if hint.is_empty() {
            return Ok(None);
        }
        self.store().write(ctx.cancel(), |tx| ensure_path(tx, hint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::TestDb;

    fn place(id: i64, parent_id: Option<i64>) -> Place {
        Place {
            id,
            name_primary: format!("p{}", id),
            name_secondary: format!("p{}", id),
            parent_id,
            place_type: PlaceType::City,
        }
    }

    #[test]
    fn test_descendants_include_self_and_transitive_children() {
        let tree = PlaceTree::from_places(vec![
            place(1, None),
            place(2, Some(1)),
            place(3, Some(2)),
            place(4, Some(1)),
            place(5, None),
        ]);
        assert_eq!(tree.descendants_of(1).unwrap(), BTreeSet::from([1, 2, 3, 4]));
        assert_eq!(tree.descendants_of(2).unwrap(), BTreeSet::from([2, 3]));
        assert_eq!(tree.descendants_of(5).unwrap(), BTreeSet::from([5]));
        assert!(matches!(
            tree.descendants_of(99),
            Err(CatalogError::NotFound { kind: "place", .. })
        ));
    }

    #[test]
    fn test_deep_chain_does_not_overflow() {
        let depth = 50_000;
        let places = (1..=depth)
            .map(|id| place(id, if id == 1 { None } else { Some(id - 1) }))
            .collect();
        let tree = PlaceTree::from_places(places);
        assert_eq!(tree.descendants_of(1).unwrap().len(), depth as usize);
        assert_eq!(tree.chain(depth).unwrap().len(), depth as usize);
    }

    #[test]
    fn test_cyclic_links_terminate() {
        let tree = PlaceTree::from_places(vec![place(1, Some(3)), place(2, Some(1)), place(3, Some(2))]);
        assert_eq!(tree.descendants_of(1).unwrap(), BTreeSet::from([1, 2, 3]));
        assert_eq!(tree.chain(1).unwrap().len(), 3);
    }

    #[test]
    fn test_chain_is_root_first() {
        let t = TestDb::new();
        let sweden = t.add_place("Sweden", None, PlaceType::Country);
        let stockholm = t.add_place("Stockholm", Some(sweden), PlaceType::City);
        let street = t.add_place("Drottninggatan", Some(stockholm), PlaceType::Street);

        let chain = t.db.place_chain(&t.db.request(), street).unwrap();
        let names: Vec<_> = chain.iter().map(|p| p.name_primary.as_str()).collect();
        assert_eq!(names, vec!["Sweden", "Stockholm", "Drottninggatan"]);
    }

    #[test]
    fn test_sibling_names_unique_per_parent() {
        let t = TestDb::new();
        let ctx = t.editor("alice");
        let sweden = t.add_place("Sweden", None, PlaceType::Country);
        let norway = t.add_place("Norway", None, PlaceType::Country);
        t.add_place("Centrum", Some(sweden), PlaceType::City);
        t.add_place("Centrum", Some(norway), PlaceType::City);

        let duplicate = t.db.create_place(
            &ctx,
            &NewPlace {
                name_primary: "Centrum".to_string(),
                name_secondary: "Downtown".to_string(),
                parent_id: Some(sweden),
                place_type: PlaceType::City,
            },
        );
        assert!(matches!(duplicate, Err(CatalogError::Conflict(_))));

        let duplicate_root = t.db.create_place(
            &ctx,
            &NewPlace {
                name_primary: "Sverige".to_string(),
                name_secondary: "Sweden".to_string(),
                parent_id: None,
                place_type: PlaceType::Country,
            },
        );
        assert!(matches!(duplicate_root, Err(CatalogError::Conflict(_))));
    }

    #[test]
    fn test_create_place_validates_parent() {
        let t = TestDb::new();
        let ctx = t.editor("alice");
        let city = t.add_place("Uppsala", None, PlaceType::City);

        let unknown_parent = t.db.create_place(
            &ctx,
            &NewPlace {
                name_primary: "Main St".to_string(),
                name_secondary: "Main St".to_string(),
                parent_id: Some(999),
                place_type: PlaceType::Street,
            },
        );
        assert!(matches!(unknown_parent, Err(CatalogError::NotFound { .. })));

        let inverted = t.db.create_place(
            &ctx,
            &NewPlace {
                name_primary: "Sweden".to_string(),
                name_secondary: "Sweden".to_string(),
                parent_id: Some(city),
                place_type: PlaceType::Country,
            },
        );
        assert!(matches!(inverted, Err(CatalogError::Validation(_))));
    }

    #[test]
    fn test_ensure_place_path_reuses_and_skips_levels() {
        let t = TestDb::new();
        let ctx = t.db.request();
        let sweden = t.add_place("Sweden", None, PlaceType::Country);

        let hint = PlaceHint {
            country: Some("Sweden".to_string()),
            state: None,
            city: Some("Göteborg".to_string()),
            street: Some("  ".to_string()),
        };
        let city = t.db.ensure_place_path(&ctx, &hint).unwrap().unwrap();
        let again = t.db.ensure_place_path(&ctx, &hint).unwrap().unwrap();
        assert_eq!(city, again);

        let chain = t.db.place_chain(&ctx, city).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].id, sweden);
        assert_eq!(chain[1].place_type, PlaceType::City);

        assert_eq!(t.db.ensure_place_path(&ctx, &PlaceHint::default()).unwrap(), None);
        assert_eq!(t.db.list_places(&ctx).unwrap().len(), 2);
    }
}
