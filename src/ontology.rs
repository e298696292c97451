use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::warn;

use crate::error::{Result, TagError};
use crate::tag::{Tag, TagValue, get_dotted_identifier, skipwhite};
use crate::tagset::TagSet;

lazy_static! {
    // a trailing parenthesised suffix, as in "Captain America (Marvel)"
    static ref TRAILING_PAREN: Regex = Regex::new(r"^(.*)\(([^()]*)\)\s*$").unwrap();
    // the normalized form: dotted, but components may be all digits
    // because nonnegative integers normalize to their decimal string
    static ref NORMALIZED_NAME: Regex = Regex::new(r"^\w+(\.\w+)*$").unwrap();
}

/// The base type names a declared type may ultimately resolve to.
pub const BASE_TYPES: [&str; 7] = ["int", "float", "str", "list", "dict", "date", "datetime"];

/// The backing mapping of ontology keys to `TagSet`s.
///
/// Any store supporting keyed get/put/remove and prefix-scoped key
/// enumeration is acceptable: an in-memory map, a tag file, or an SQL
/// table of name to `TagSet`. The ontology itself performs no I/O
/// beyond calls into this trait.
pub trait TagSetsStore: Send {
    fn get(&self, key: &str) -> Option<TagSet>;
    fn put(&mut self, key: &str, tags: TagSet);
    fn remove(&mut self, key: &str) -> Option<TagSet>;
    /// The keys starting with `prefix`, in key order where the store
    /// supports one.
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;
}

/// The in-memory backing store.
#[derive(Debug, Default)]
pub struct MemoryTagSets {
    tagsets: BTreeMap<String, TagSet>,
}

impl MemoryTagSets {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TagSetsStore for MemoryTagSets {
    fn get(&self, key: &str) -> Option<TagSet> {
        self.tagsets.get(key).cloned()
    }
    fn put(&mut self, key: &str, tags: TagSet) {
        self.tagsets.insert(key.to_string(), tags);
    }
    fn remove(&mut self, key: &str) -> Option<TagSet> {
        self.tagsets.remove(key)
    }
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.tagsets
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Metadata about one value, resolved through an ontology.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueMetadata {
    /// The key within the ontology providing the metadata.
    pub ontkey: String,
    /// The value the metadata describes.
    pub value: TagValue,
    /// The metadata itself.
    pub tags: TagSet,
}

/// The metadata for a tag value: a single lookup for scalar types,
/// per-member lookups for `list` types, and key and value lookups for
/// `dict` types. Members that cannot be normalized resolve to `None`.
#[derive(Debug, Clone, PartialEq)]
pub enum TagMetadata {
    Scalar(Option<ValueMetadata>),
    List(Vec<Option<ValueMetadata>>),
    Map(Vec<(Option<ValueMetadata>, Option<ValueMetadata>)>),
}

/// An ontology for tag names.
///
/// This is a mapping of ontology keys to `TagSet`s, where the keys
/// follow two conventions:
/// * `type.<type_name>` defines a type: its base type, and for `list`
///   and `dict` types the `member_type` (and `key_type`).
/// * `meta.<type_name>.<value_key>` holds descriptive metadata for a
///   specific value of that type, where `<value_key>` comes from
///   `value_to_tag_name`.
///
/// A `TagsOntology` is constructed once per backing store and shared
/// explicitly (an `Arc` per referencing `TagSet` or `Tag`). Mutation
/// goes through one coarse lock per store.
pub struct TagsOntology {
    store: Mutex<Box<dyn TagSetsStore>>,
}

impl TagsOntology {
    pub fn new(store: impl TagSetsStore + 'static) -> Self {
        Self { store: Mutex::new(Box::new(store)) }
    }

    /// The ontology key defining the type `type_name`.
    pub fn type_index(type_name: &str) -> String {
        format!("type.{}", type_name)
    }

    /// The ontology key holding metadata for `value` of type
    /// `type_name`.
    pub fn meta_index(type_name: &str, value: &TagValue) -> Result<String> {
        Ok(format!("meta.{}.{}", type_name, Self::value_to_tag_name(value)?))
    }

    /// Convert a tag value to a tag-name-like dotted string for use
    /// in ontology lookup.
    ///
    /// Nonnegative integers become their decimal string. For strings,
    /// a trailing parenthesised suffix `"X (Y)"` is rewritten to a
    /// leading dotted prefix `"y.x"`, then the whole string is
    /// lowercased with internal whitespace runs becoming single
    /// underscores. Other value types fail with an error.
    pub fn value_to_tag_name(value: &TagValue) -> Result<String> {
        let name = match value {
            TagValue::Int(i) if *i >= 0 => i.to_string(),
            TagValue::Str(s) => {
                let s = s.trim();
                let rewritten = match TRAILING_PAREN.captures(s) {
                    Some(caps) => format!(
                        "{}.{}",
                        caps.get(2).unwrap().as_str().trim(),
                        caps.get(1).unwrap().as_str().trim()
                    ),
                    None => s.to_string(),
                };
                rewritten.to_lowercase().split_whitespace().collect::<Vec<_>>().join("_")
            }
            other => {
                return Err(TagError::UnsupportedValue(format!(
                    "cannot convert {:?} to a tag name",
                    other
                )));
            }
        };
        assert!(
            NORMALIZED_NAME.is_match(&name),
            "value_to_tag_name produced {:?}, not a dotted name",
            name
        );
        Ok(name)
    }

    fn entry(&self, key: &str) -> TagSet {
        self.store.lock().unwrap().get(key).unwrap_or_default()
    }

    /// The `TagSet` stored at `key`, if any.
    pub fn get_entry(&self, key: &str) -> Option<TagSet> {
        self.store.lock().unwrap().get(key)
    }

    /// Store `tags` at `key`.
    pub fn put_entry(&self, key: &str, tags: TagSet) {
        self.store.lock().unwrap().put(key, tags);
    }

    /// Parse a tag line and store it at `key`. Convenient when
    /// seeding an ontology.
    pub fn define(&self, key: &str, line: &str) -> Result<()> {
        let tags = TagSet::from_line(line, None)?;
        self.put_entry(key, tags);
        Ok(())
    }

    pub fn remove_entry(&self, key: &str) -> Option<TagSet> {
        self.store.lock().unwrap().remove(key)
    }

    /// Fetch the `TagSet` defining `type_name`, synthesizing an empty
    /// one for missing entries. Never fails for a well-formed name.
    pub fn typedef(&self, type_name: &str) -> TagSet {
        self.entry(&Self::type_index(type_name))
    }

    /// Fetch the metadata `TagSet` for `value` of `type_name`,
    /// synthesizing an empty one for missing entries.
    pub fn metadata(&self, type_name: &str, value: &TagValue) -> Result<TagSet> {
        Ok(self.entry(&Self::meta_index(type_name, value)?))
    }

    /// Infer the base type name for `type_name` by following its
    /// `type=` chain. The default is `str`; any chain resolving to a
    /// name in `BASE_TYPES` yields that name. A chain revisiting a
    /// name is broken with a warning; the unresolved name then falls
    /// back to `str` like any other non-base name.
    pub fn basetype(&self, type_name: &str) -> String {
        let mut typename = type_name.to_string();
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(typename.clone());
        loop {
            let typedata = self.typedef(&typename);
            match typedata.get_str("type") {
                None => break,
                Some(next) => {
                    let repeat = seen.contains(&next);
                    typename = next;
                    if repeat {
                        warn!(
                            type_name,
                            "circular type definitions involving {:?}", seen
                        );
                        break;
                    }
                    seen.insert(typename.clone());
                }
            }
        }
        if BASE_TYPES.contains(&typename.as_str()) {
            typename
        } else {
            "str".to_string()
        }
    }

    /// Resolve `value` of `type_name` to its metadata: the ontology
    /// key, the value, and the metadata `TagSet`. The value key comes
    /// from `convert` when supplied, else from `value_to_tag_name`.
    /// Unconvertible values soft-fail to `None` with a warning.
    pub fn value_metadata(
        &self,
        type_name: &str,
        value: &TagValue,
        convert: Option<&dyn Fn(&TagValue) -> Option<String>>,
    ) -> Option<ValueMetadata> {
        let value_key = match convert {
            Some(f) => f(value)?,
            None => match Self::value_to_tag_name(value) {
                Ok(key) => key,
                Err(e) => {
                    warn!(type_name, "no metadata key for {:?}: {}", value, e);
                    return None;
                }
            },
        };
        let ontkey = format!("meta.{}.{}", type_name, value_key);
        let tags = self.entry(&ontkey);
        Some(ValueMetadata { ontkey, value: value.clone(), tags })
    }

    /// The names of the defined types, lazily fetched.
    pub fn type_names(&self) -> impl Iterator<Item = String> + '_ {
        self.store
            .lock()
            .unwrap()
            .keys_with_prefix("type.")
            .into_iter()
            .map(|key| key["type.".len()..].to_string())
    }

    /// The defined types with their defining `TagSet`s. Each `TagSet`
    /// is fetched as the iterator advances.
    pub fn types(&self) -> impl Iterator<Item = (String, TagSet)> + '_ {
        self.type_names().map(move |name| {
            let tags = self.typedef(&name);
            (name, tags)
        })
    }

    /// The metadata entry names, optionally scoped to one type. Names
    /// are returned with the `meta.` (or `meta.<type>.`) prefix
    /// stripped.
    pub fn meta_names(&self, type_name: Option<&str>) -> impl Iterator<Item = String> + '_ {
        let prefix = match type_name {
            Some(t) => format!("meta.{}.", t),
            None => "meta.".to_string(),
        };
        let plen = prefix.len();
        self.store
            .lock()
            .unwrap()
            .keys_with_prefix(&prefix)
            .into_iter()
            .map(move |key| key[plen..].to_string())
    }

    /// Bulk-edit the entries at `indices` by round-tripping them
    /// through one text line each, `key tag tag...`. With a `prefix`,
    /// keys are rendered and re-parsed with that prefix stripped.
    ///
    /// A line whose key changed renames the entry. A rename whose new
    /// key already exists, or which another edited line also claims,
    /// is refused with a warning and both originals are left intact;
    /// the remaining edits still apply. Returns the applied renames.
    pub fn edit_indices<F>(
        &self,
        indices: &[String],
        prefix: Option<&str>,
        editor: F,
    ) -> Result<Vec<(String, String)>>
    where
        F: FnOnce(&str) -> String,
    {
        let strip = prefix.map(|p| format!("{}.", p)).unwrap_or_default();
        let mut lines = Vec::new();
        for key in indices {
            let shown = key.strip_prefix(&strip).unwrap_or(key);
            lines.push(format!("{} {}", shown, self.entry(key)));
        }
        let edited = editor(&lines.join("\n"));
        let edited_lines: Vec<&str> = edited.lines().collect();
        if edited_lines.len() != indices.len() {
            return Err(TagError::parse(
                format!(
                    "edited {} lines, expected {}",
                    edited_lines.len(),
                    indices.len()
                ),
                0,
            ));
        }
        // parse every line before touching the store
        let mut parsed = Vec::new();
        for (old_key, line) in indices.iter().zip(edited_lines) {
            let (shown_key, offset) = get_dotted_identifier(line, 0).ok_or_else(|| {
                TagError::parse(format!("missing key in edited line {:?}", line), 0)
            })?;
            let new_key = format!("{}{}", strip, shown_key);
            let tags = TagSet::from_line(&line[skipwhite(line, offset)..], None)?;
            parsed.push((old_key.clone(), new_key, tags));
        }
        let mut claimed: HashSet<&str> = HashSet::new();
        let mut collided: HashSet<usize> = HashSet::new();
        for (i, (old_key, new_key, _)) in parsed.iter().enumerate() {
            if old_key != new_key {
                let exists = {
                    let store = self.store.lock().unwrap();
                    store.get(new_key).is_some()
                };
                if exists || !claimed.insert(new_key.as_str()) {
                    warn!(
                        %old_key,
                        %new_key, "rename collides with an existing entry, skipped"
                    );
                    collided.insert(i);
                }
            }
        }
        // a rename into a key another line also claims collides both ways
        for (i, (old_key, new_key, _)) in parsed.iter().enumerate() {
            if old_key != new_key
                && parsed
                    .iter()
                    .enumerate()
                    .any(|(j, (_, other_new, _))| j != i && other_new == new_key)
            {
                collided.insert(i);
            }
        }
        let mut renamed = Vec::new();
        for (i, (old_key, new_key, new_tags)) in parsed.iter().enumerate() {
            if collided.contains(&i) {
                continue;
            }
            let mut current = self.entry(old_key);
            current.set_from(&new_tags.as_map());
            let mut store = self.store.lock().unwrap();
            if old_key != new_key {
                store.remove(old_key);
                store.put(new_key, current);
                renamed.push((old_key.clone(), new_key.clone()));
            } else {
                store.put(old_key, current);
            }
        }
        Ok(renamed)
    }

    /// Convert a tag's value according to its declared base type,
    /// returning a new tag with the converted value or the original
    /// tag unchanged. Aimed at things like regexp based autotagging,
    /// where every match is a string but some fields carry `int`s or
    /// `date`s.
    pub fn convert_tag(self: &Arc<Self>, tag: &Tag) -> Tag {
        let attached = tag.with_ontology(Some(Arc::clone(self)));
        let Some(basetype) = attached.basetype() else {
            return tag.clone();
        };
        let TagValue::Str(text) = tag.value() else {
            return tag.clone();
        };
        let converted = match basetype.as_str() {
            "int" => text.parse::<i64>().ok().map(TagValue::Int),
            "float" => text.parse::<f64>().ok().map(TagValue::Float),
            "date" => chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .map(TagValue::Date),
            "datetime" => {
                chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(TagValue::DateTime)
            }
            _ => None,
        };
        match converted {
            Some(value) => Tag::unchecked(tag.name().to_string(), value)
                .with_ontology(tag.ontology().cloned()),
            None => tag.clone(),
        }
    }
}

impl fmt::Debug for TagsOntology {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let keys = self.store.lock().unwrap().keys_with_prefix("");
        f.debug_struct("TagsOntology").field("keys", &keys.len()).finish()
    }
}
