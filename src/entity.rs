// used to keep the one-to-one mapping between entity names and their ids
use bimap::BiMap;

use core::hash::BuildHasherDefault;
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::DateTime;
use seahash::SeaHasher;

use crate::criterion::{IdSet, TagSetCriterion};
use crate::error::{Result, TagError};
use crate::namespace::TagSetNamespace;
use crate::tag::{Tag, TagValue};
use crate::tagset::TagSet;

pub type IdHasher = BuildHasherDefault<SeaHasher>;

/// Seconds since the UNIX epoch, as a float.
pub fn now_unixtime() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// An entity record with its `Tag`s.
///
/// The `id` is a surrogate key, present only for store-backed
/// entities. The `name` is an optional string, unique among entities
/// in the same store; log-style entries have no name. The `unixtime`
/// is the creation or event timestamp.
///
/// This is also the intermediary form of the CSV import/export row,
/// `unixtime,id,name,tag...`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEntity {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub unixtime: f64,
    pub tags: TagSet,
}

impl TaggedEntity {
    pub fn new(id: Option<i64>, name: Option<String>, unixtime: f64, tags: TagSet) -> Self {
        Self { id, name, unixtime, tags }
    }

    /// Set a tag on this entity's tags.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<TagValue>) {
        self.tags.set(name, value);
    }

    /// Discard a tag from this entity's tags.
    pub fn discard(&mut self, name: &str, value: Option<&TagValue>) -> Option<Tag> {
        self.tags.discard(name, value)
    }

    /// This entity as a CSV export row: `unixtime,id,name,tag...`
    /// with each tag in its text form. The inverse of `from_csvrow`.
    pub fn csvrow(&self) -> String {
        let mut fields = vec![
            format_unixtime(self.unixtime),
            self.id.map(|id| id.to_string()).unwrap_or_default(),
            self.name.clone().unwrap_or_default(),
        ];
        for tag in self.tags.as_tags() {
            fields.push(tag.to_string());
        }
        fields.iter().map(|f| csv_quote(f)).collect::<Vec<_>>().join(",")
    }

    /// Construct a `TaggedEntity` from a CSV row like that from
    /// `csvrow`.
    pub fn from_csvrow(row: &str) -> Result<Self> {
        let fields = split_csv_row(row)?;
        if fields.len() < 3 {
            return Err(TagError::parse(
                format!("short CSV row, expected unixtime,id,name,...: {:?}", row),
                0,
            ));
        }
        let unixtime: f64 = fields[0]
            .parse()
            .map_err(|_| TagError::parse(format!("bad unixtime {:?}", fields[0]), 0))?;
        let id = if fields[1].is_empty() {
            None
        } else {
            Some(fields[1].parse::<i64>().map_err(|_| {
                TagError::parse(format!("bad entity id {:?}", fields[1]), 0)
            })?)
        };
        let name = if fields[2].is_empty() { None } else { Some(fields[2].clone()) };
        let mut tags = TagSet::new();
        for field in &fields[3..] {
            let tag: Tag = field.parse()?;
            tags.add(tag);
        }
        Ok(Self { id, name, unixtime, tags })
    }

    /// A `TagSet` of this entity's tags plus derived `entity.*` tags
    /// (`entity.id`, `entity.name`, `entity.unixtime`,
    /// `entity.datetime`, `entity.isotime`) for rendering.
    pub fn format_tagset(&self) -> TagSet {
        let mut kwtags = self.tags.clone();
        if let Some(id) = self.id {
            kwtags.set("entity.id", TagValue::Int(id));
        }
        if let Some(name) = &self.name {
            kwtags.set("entity.name", TagValue::Str(name.clone()));
        }
        kwtags.set("entity.unixtime", TagValue::Float(self.unixtime));
        if let Some(dt) = unixtime_to_datetime(self.unixtime) {
            kwtags.set("entity.datetime", TagValue::DateTime(dt));
            kwtags.set(
                "entity.isotime",
                TagValue::Str(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            );
        }
        kwtags
    }

    /// Format arguments suitable for template rendering: the
    /// namespace of `format_tagset` plus a `tags` entry holding the
    /// whole tag line.
    pub fn format_kwargs(&self) -> TagSetNamespace {
        let mut kwtags = self.format_tagset();
        kwtags.set("tags", TagValue::Str(self.tags.to_string()));
        kwtags.ns()
    }
}

impl fmt::Display for TaggedEntity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TaggedEntity(id={:?},name={:?},unixtime={})",
            self.id, self.name, self.unixtime
        )
    }
}

pub(crate) fn unixtime_to_datetime(unixtime: f64) -> Option<chrono::NaiveDateTime> {
    let secs = unixtime.floor();
    let nanos = ((unixtime - secs) * 1e9).round() as u32;
    DateTime::from_timestamp(secs as i64, nanos).map(|dt| dt.naive_utc())
}

// Floats print with a trailing .0 when integral, matching the
// exporter this row format interoperates with.
fn format_unixtime(unixtime: f64) -> String {
    if unixtime.is_finite() && unixtime == unixtime.trunc() {
        format!("{:.1}", unixtime)
    } else {
        format!("{}", unixtime)
    }
}

fn csv_quote(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
    {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn split_csv_row(row: &str) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = row.chars().peekable();
    let mut quoted = false;
    while let Some(c) = chars.next() {
        if quoted {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    quoted = false;
                }
            } else {
                field.push(c);
            }
        } else {
            match c {
                '"' => quoted = true,
                ',' => fields.push(std::mem::take(&mut field)),
                _ => field.push(c),
            }
        }
    }
    if quoted {
        return Err(TagError::parse(format!("unterminated quote in CSV row {:?}", row), 0));
    }
    fields.push(field);
    Ok(fields)
}

// ------------- EntityTable -------------

/// An in-memory keeper of tagged entities.
///
/// Ids are generated from a monotonic counter. Names are unique and
/// indexed both ways, name to id and id to name.
#[derive(Debug)]
pub struct EntityTable {
    next_id: i64,
    entities: HashMap<i64, TaggedEntity, IdHasher>,
    names: BiMap<String, i64>,
}

impl Default for EntityTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityTable {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entities: HashMap::default(),
            names: BiMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Add a new entity, enforcing name uniqueness. Returns its id.
    pub fn add(&mut self, name: Option<&str>, unixtime: f64, tags: TagSet) -> Result<i64> {
        if let Some(name) = name {
            if self.names.contains_left(name) {
                return Err(TagError::Invariant(format!(
                    "entity name {:?} already present",
                    name
                )));
            }
        }
        self.next_id += 1;
        let id = self.next_id;
        if let Some(name) = name {
            self.names.insert(name.to_string(), id);
        }
        self.entities.insert(
            id,
            TaggedEntity::new(Some(id), name.map(str::to_string), unixtime, tags),
        );
        Ok(id)
    }

    /// Fetch-or-create the entity named `name`. Returns its id.
    pub fn make(&mut self, name: &str, unixtime: f64) -> i64 {
        match self.names.get_by_left(name) {
            Some(id) => *id,
            None => self.add(Some(name), unixtime, TagSet::new()).unwrap(),
        }
    }

    pub fn get(&self, id: i64) -> Option<&TaggedEntity> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: i64) -> Option<&mut TaggedEntity> {
        self.entities.get_mut(&id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&TaggedEntity> {
        self.names.get_by_left(name).and_then(|id| self.entities.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaggedEntity> {
        self.entities.values()
    }

    /// The entities matching all of `criteria`, in id order.
    ///
    /// Each criterion contributes a result set of matching ids and
    /// the sets are intersected, mirroring the AND semantics of the
    /// SQL join chain.
    pub fn find(&self, criteria: &[TagSetCriterion]) -> Vec<&TaggedEntity> {
        let mut result: Option<IdSet> = None;
        for criterion in criteria {
            let mut ids = IdSet::new();
            for (id, entity) in &self.entities {
                if criterion.match_entity(entity) {
                    ids.push(*id as u64);
                }
            }
            match &mut result {
                None => result = Some(ids),
                Some(r) => r.intersect_with(&ids),
            }
            if result.as_ref().is_some_and(|r| r.is_empty()) {
                return Vec::new();
            }
        }
        match result {
            None => {
                let mut all: Vec<&TaggedEntity> = self.entities.values().collect();
                all.sort_by_key(|e| e.id);
                all
            }
            Some(ids) => ids
                .to_vec()
                .into_iter()
                .filter_map(|id| self.entities.get(&(id as i64)))
                .collect(),
        }
    }
}
