// used for persistence
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{ToSql, ToSqlOutput};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Mutex;

use regex::Regex;
use tracing::debug;

use crate::criterion::TagSetCriterion;
use crate::entity::{TaggedEntity, now_unixtime};
use crate::error::{Result, TagError};
use crate::tag::{Tag, TagValue};
use crate::tagset::TagSet;

/// A tag value reduced to one of the three SQL column affinities.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Integer(i64),
    Real(f64),
    Text(String),
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Integer(i) => ToSqlOutput::from(*i),
            SqlValue::Real(f) => ToSqlOutput::from(*f),
            SqlValue::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

/// The column and comparison value for testing a tag value in SQL.
///
/// Numbers use the float column; strings, dates and uuids the string
/// column; booleans and collections the structured JSON column.
/// Datetimes are stored as unixtime floats. `None` values occupy no
/// column at all, so a bare tag row is all-null.
pub(crate) fn value_test(value: &TagValue) -> Option<(&'static str, SqlValue)> {
    match value {
        TagValue::None => None,
        TagValue::Float(f) => Some(("float_value", SqlValue::Real(*f))),
        TagValue::Int(i) => {
            let f = *i as f64;
            if f as i64 == *i {
                Some(("float_value", SqlValue::Real(f)))
            } else {
                Some(("structured_value", SqlValue::Text(i.to_string())))
            }
        }
        TagValue::Str(s) => Some(("string_value", SqlValue::Text(s.clone()))),
        TagValue::Date(_) | TagValue::Uuid(_) => {
            Some(("string_value", SqlValue::Text(value.transcribe())))
        }
        TagValue::DateTime(dt) => {
            let utc = dt.and_utc();
            let unixtime =
                utc.timestamp() as f64 + utc.timestamp_subsec_nanos() as f64 / 1e9;
            Some(("float_value", SqlValue::Real(unixtime)))
        }
        TagValue::Bool(_) | TagValue::List(_) | TagValue::Map(_) => Some((
            "structured_value",
            SqlValue::Text(
                serde_json::to_string(&value.to_json()).unwrap_or_else(|_| "null".to_string()),
            ),
        )),
    }
}

/// Split a tag value over the three value columns. At most one
/// column is non-null.
fn value_columns(value: &TagValue) -> (Option<f64>, Option<String>, Option<String>) {
    match value_test(value) {
        None => (None, None, None),
        Some(("float_value", SqlValue::Real(f))) => (Some(f), None, None),
        Some(("string_value", SqlValue::Text(s))) => (None, Some(s), None),
        Some(("structured_value", SqlValue::Text(s))) => (None, None, Some(s)),
        Some(_) => (None, None, None),
    }
}

/// Choose amongst the value columns of one tag row.
pub(crate) fn pick_value(
    float_value: Option<f64>,
    string_value: Option<String>,
    structured_value: Option<String>,
) -> TagValue {
    if let Some(f) = float_value {
        return TagValue::Float(f);
    }
    if let Some(s) = string_value {
        return TagValue::Str(s);
    }
    if let Some(j) = structured_value {
        return match serde_json::from_str(&j) {
            Ok(json) => TagValue::from_json(json),
            Err(_) => TagValue::Str(j),
        };
    }
    TagValue::None
}

// ------------- SqlTags -------------

/// An SQLite store of tagged entities.
///
/// Entities live in an `entities` table with an optional unique name
/// and a unixtime; their tags live in a `tags` table with one row per
/// `(entity, name)` and the tag value split across float, string and
/// structured columns. Tag mutations write through per call. All
/// access serializes on one coarse lock around the connection.
pub struct SqlTags {
    conn: Mutex<Connection>,
}

impl SqlTags {
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            create table if not exists entities (
                id integer not null,
                name text null,
                unixtime real null,
                constraint referenceable_entity_id primary key (
                    id
                ),
                constraint unique_entity_name unique (
                    name
                )
            );
            create table if not exists tags (
                id integer not null,
                entity_id integer not null,
                name text not null,
                float_value real null,
                string_value text null,
                structured_value text null,
                constraint referenceable_tag_id primary key (
                    id
                ),
                constraint tag_of_entity foreign key (
                    entity_id
                ) references entities(id),
                constraint one_value_per_tag_name unique (
                    entity_id,
                    name
                )
            );
            create index if not exists tags_by_name on tags(name);
            ",
        )?;
        // the REGEXP operator X REGEXP Y calls regexp(Y, X)
        conn.create_scalar_function(
            "regexp",
            2,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let pattern: String = ctx.get(0)?;
                let text: Option<String> = ctx.get(1)?;
                Ok(match text {
                    None => false,
                    Some(text) => Regex::new(&pattern)
                        .map(|re| re.is_match(&text))
                        .unwrap_or(false),
                })
            },
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| TagError::Lock(e.to_string()))
    }

    /// Add a new entity. Returns its id.
    pub fn add(&self, name: Option<&str>, unixtime: f64) -> Result<i64> {
        let conn = self.lock()?;
        conn.prepare_cached(
            "
            insert into entities (
                name,
                unixtime
            ) values (?, ?)
        ",
        )?
        .execute(params![name, unixtime])?;
        Ok(conn.last_insert_rowid())
    }

    /// Fetch-or-create the entity named `name`. Returns its id.
    pub fn make(&self, name: &str) -> Result<i64> {
        if let Some(entity) = self.get_by_name(name)? {
            return Ok(entity.id.unwrap());
        }
        self.add(Some(name), now_unixtime())
    }

    /// The entity with `id`, with its tags, or `None`.
    pub fn get(&self, id: i64) -> Result<Option<TaggedEntity>> {
        let row = {
            let conn = self.lock()?;
            conn.prepare_cached(
                "
                select id, name, unixtime
                    from entities
                    where id = ?
            ",
            )?
            .query_row(params![id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?, row.get::<_, Option<f64>>(2)?))
            })
            .optional()?
        };
        match row {
            None => Ok(None),
            Some((id, name, unixtime)) => {
                let tags = self.tags(id)?;
                Ok(Some(TaggedEntity::new(Some(id), name, unixtime.unwrap_or(0.0), tags)))
            }
        }
    }

    /// The entity named `name`, with its tags, or `None`.
    pub fn get_by_name(&self, name: &str) -> Result<Option<TaggedEntity>> {
        let id = {
            let conn = self.lock()?;
            conn.prepare_cached(
                "
                select id
                    from entities
                    where name = ?
            ",
            )?
            .query_row(params![name], |row| row.get::<_, i64>(0))
            .optional()?
        };
        match id {
            None => Ok(None),
            Some(id) => self.get(id),
        }
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn
            .prepare_cached("select count(*) from entities")?
            .query_row([], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// The `TagSet` for one entity.
    ///
    /// This is a copy; modifying it does not affect the stored tags.
    pub fn tags(&self, entity_id: i64) -> Result<TagSet> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "
            select name, float_value, string_value, structured_value
                from tags
                where entity_id = ?
        ",
        )?;
        let mut tags = TagSet::new();
        let mut rows = stmt.query(params![entity_id])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let value = pick_value(row.get(1)?, row.get(2)?, row.get(3)?);
            tags.set(name, value);
        }
        tags.reset_modified();
        Ok(tags)
    }

    /// Set a tag for the entity, replacing any existing tag of the
    /// same name. Written through immediately.
    pub fn add_tag(&self, entity_id: i64, tag: &Tag) -> Result<()> {
        let (float_value, string_value, structured_value) = value_columns(tag.value());
        let conn = self.lock()?;
        conn.prepare_cached(
            "
            insert into tags (
                entity_id,
                name,
                float_value,
                string_value,
                structured_value
            ) values (?, ?, ?, ?, ?)
            on conflict (entity_id, name) do update set
                float_value = excluded.float_value,
                string_value = excluded.string_value,
                structured_value = excluded.structured_value
        ",
        )?
        .execute(params![entity_id, tag.name(), float_value, string_value, structured_value])?;
        Ok(())
    }

    /// Discard the entity's tag matching `(name, value)`. A `None`
    /// value discards unconditionally. Returns the discarded tag.
    pub fn discard_tag(
        &self,
        entity_id: i64,
        name: &str,
        value: Option<&TagValue>,
    ) -> Result<Option<Tag>> {
        let held = {
            let conn = self.lock()?;
            conn.prepare_cached(
                "
                select float_value, string_value, structured_value
                    from tags
                    where entity_id = ? and name = ?
            ",
            )?
            .query_row(params![entity_id, name], |row| {
                Ok(pick_value(row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .optional()?
        };
        let Some(held) = held else {
            return Ok(None);
        };
        if value.is_some_and(|v| !held.equals(v)) {
            return Ok(None);
        }
        let conn = self.lock()?;
        conn.prepare_cached(
            "
            delete from tags
                where entity_id = ? and name = ?
        ",
        )?
        .execute(params![entity_id, name])?;
        Ok(Some(Tag::unchecked(name.to_string(), held)))
    }

    /// The entities matching all of `criteria`, with their tags, in
    /// id order.
    ///
    /// Each criterion contributes a join fragment; fragments chain on
    /// the previous criterion's entity id column and the final result
    /// is the intersection of the per-criterion constraints, matching
    /// the in-memory AND semantics.
    pub fn find(&self, criteria: &[TagSetCriterion]) -> Result<Vec<TaggedEntity>> {
        let mut sql = String::from("select e.id, e.name, e.unixtime from entities e");
        let mut sql_params: Vec<SqlValue> = Vec::new();
        let mut filters: Vec<String> = Vec::new();
        let mut filter_params: Vec<SqlValue> = Vec::new();
        let mut prev_entity_id_col = "e.id".to_string();
        for (index, criterion) in criteria.iter().enumerate() {
            let fragment = criterion.sql_fragment(index, &prev_entity_id_col);
            if let Some((on, on_params)) = fragment.join_constraint {
                sql.push_str(if fragment.outer { " left join " } else { " join " });
                sql.push_str(&format!("{} {} on {}", fragment.table, fragment.alias, on));
                sql_params.extend(on_params);
                // an outer join's entity id may be null, so only
                // inner joins advance the chain column
                if !fragment.outer {
                    prev_entity_id_col = fragment.entity_id_column;
                }
            }
            if let Some((filter, params)) = fragment.filter {
                filters.push(filter);
                filter_params.extend(params);
            }
        }
        if !filters.is_empty() {
            sql.push_str(" where ");
            sql.push_str(&filters.join(" and "));
            sql_params.extend(filter_params);
        }
        sql.push_str(" order by e.id");
        debug!(%sql, "find");
        let rows = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(sql_params.iter()))?;
            let mut found: Vec<(i64, Option<String>, Option<f64>)> = Vec::new();
            while let Some(row) = rows.next()? {
                found.push((row.get(0)?, row.get(1)?, row.get(2)?));
            }
            found
        };
        let mut entities = Vec::new();
        for (id, name, unixtime) in rows {
            let tags = self.tags(id)?;
            entities.push(TaggedEntity::new(Some(id), name, unixtime.unwrap_or(0.0), tags));
        }
        Ok(entities)
    }

    /// Export the entities matching `criteria` (all entities when
    /// empty) as CSV rows `unixtime,id,name,tag...`.
    pub fn export_csv<W: Write>(&self, out: &mut W, criteria: &[TagSetCriterion]) -> Result<()> {
        for entity in self.find(criteria)? {
            writeln!(out, "{}", entity.csvrow())
                .map_err(|e| TagError::Persistence(e.to_string()))?;
        }
        Ok(())
    }

    /// Import CSV rows like those from `export_csv`, creating one
    /// entity per row. Row ids are not preserved; names are. Returns
    /// the number of imported entities.
    pub fn import_csv<R: BufRead>(&self, input: R) -> Result<usize> {
        let mut imported = 0;
        for line in input.lines() {
            let line = line.map_err(|e| TagError::Persistence(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let entity = TaggedEntity::from_csvrow(&line)?;
            let id = self.add(entity.name.as_deref(), entity.unixtime)?;
            for tag in entity.tags.as_tags() {
                self.add_tag(id, &tag)?;
            }
            imported += 1;
        }
        Ok(imported)
    }
}
