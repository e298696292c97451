// other keepers use HashSet or HashMap
use core::hash::BuildHasherDefault;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use seahash::SeaHasher;
use tracing::info;

use crate::error::{Result, TagError};
use crate::namespace::TagSetNamespace;
use crate::ontology::TagsOntology;
use crate::tag::{Tag, TagValue, skipwhite};

pub type NameHasher = BuildHasherDefault<SeaHasher>;

/// A setlike mapping of tag name to tag value.
///
/// At most one value is held per tag name; setting a name replaces
/// any existing value. All the `Tag`s yielded by a `TagSet` share its
/// ontology. Iteration yields `Tag`s in sorted name order, not raw
/// names.
#[derive(Debug, Clone, Default)]
pub struct TagSet {
    tags: HashMap<String, TagValue, NameHasher>,
    ontology: Option<Arc<TagsOntology>>,
    modified: bool,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ontology(ontology: Option<Arc<TagsOntology>>) -> Self {
        Self { ontology, ..Self::default() }
    }

    /// Create a new `TagSet` from a line of text: a whitespace
    /// separated sequence of `name[=value]` tokens.
    pub fn from_line(line: &str, ontology: Option<Arc<TagsOntology>>) -> Result<Self> {
        let mut tags = Self::with_ontology(ontology);
        let mut offset = skipwhite(line, 0);
        while offset < line.len() {
            let (tag, post_offset) = Tag::parse(line, offset)?;
            tags.add(tag);
            offset = skipwhite(line, post_offset);
        }
        Ok(tags)
    }

    pub fn ontology(&self) -> Option<&Arc<TagsOntology>> {
        self.ontology.as_ref()
    }

    pub fn set_ontology(&mut self, ontology: Option<Arc<TagsOntology>>) {
        self.ontology = ontology;
    }

    /// Whether any `set` or `discard` changed this `TagSet`.
    pub fn modified(&self) -> bool {
        self.modified
    }

    pub fn reset_modified(&mut self) {
        self.modified = false;
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&TagValue> {
        self.tags.get(name)
    }

    /// The string value at `name`, if any.
    pub fn get_str(&self, name: &str) -> Option<String> {
        match self.tags.get(name) {
            Some(TagValue::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    /// Membership test for `(name, value)`; a `None` value tests the
    /// name alone.
    pub fn contains(&self, name: &str, value: Option<&TagValue>) -> bool {
        match self.tags.get(name) {
            None => false,
            Some(held) => match value {
                None => true,
                Some(v) => held == v,
            },
        }
    }

    /// Set `name` to `value`, replacing any existing value.
    /// A change marks the set modified and emits a change record;
    /// setting an identical value is a no-op.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<TagValue>) {
        let name = name.into();
        let value = value.into();
        let changed = match self.tags.get(&name) {
            Some(old_value) if *old_value == value => false,
            old_value => {
                info!(
                    "+ {} (was {:?})",
                    Tag::unchecked(name.clone(), value.clone()),
                    old_value
                );
                true
            }
        };
        if changed {
            self.modified = true;
            self.tags.insert(name, value);
        }
    }

    /// Add a `Tag` to this `TagSet`.
    pub fn add(&mut self, tag: Tag) {
        self.set(tag.name().to_string(), tag.value().clone());
    }

    /// Discard the tag matching `(name, value)` and return it.
    /// A `None` value discards unconditionally; otherwise the tag is
    /// only discarded when its value matches.
    pub fn discard(&mut self, name: &str, value: Option<&TagValue>) -> Option<Tag> {
        match self.tags.get(name) {
            None => None,
            Some(held) => {
                if value.is_some_and(|v| held != v) {
                    return None;
                }
                let old_value = self.tags.remove(name).unwrap();
                self.modified = true;
                let old_tag = Tag::unchecked(name.to_string(), old_value)
                    .with_ontology(self.ontology.clone());
                info!("- {}", old_tag);
                Some(old_tag)
            }
        }
    }

    /// Update from `(name, value)` pairs, optionally prefixing each
    /// name with `prefix.`.
    pub fn update<I>(&mut self, items: I, prefix: Option<&str>)
    where
        I: IntoIterator<Item = (String, TagValue)>,
    {
        for (name, value) in items {
            match prefix {
                Some(p) if !p.is_empty() => self.set(format!("{}.{}", p, name), value),
                _ => self.set(name, value),
            }
        }
    }

    /// Completely replace the contents of this `TagSet` with the
    /// contents of `other`, applying exactly the additions and
    /// removals needed. Matching entries are untouched; every change
    /// is routed through `set`/`discard` so change records fire
    /// uniformly.
    pub fn set_from(&mut self, other: &BTreeMap<String, TagValue>) {
        for (name, value) in other {
            if self.tags.get(name) != Some(value) {
                self.set(name.clone(), value.clone());
            }
        }
        let extra: Vec<String> = self
            .tags
            .keys()
            .filter(|name| !other.contains_key(*name))
            .cloned()
            .collect();
        for name in extra {
            self.discard(&name, None);
        }
    }

    /// A new `TagSet` holding the entries whose names start with
    /// `prefix.`, with that prefix stripped.
    pub fn subtags(&self, prefix: &str) -> TagSet {
        let dotted = format!("{}.", prefix);
        let mut sub = TagSet::with_ontology(self.ontology.clone());
        for (name, value) in &self.tags {
            if let Some(stripped) = name.strip_prefix(&dotted) {
                sub.tags.insert(stripped.to_string(), value.clone());
            }
        }
        sub
    }

    /// The tag data as `Tag`s in sorted name order, sharing this
    /// set's ontology.
    pub fn as_tags(&self) -> Vec<Tag> {
        let mut tags: Vec<Tag> = self
            .tags
            .iter()
            .map(|(name, value)| {
                Tag::unchecked(name.clone(), value.clone()).with_ontology(self.ontology.clone())
            })
            .collect();
        tags.sort();
        tags
    }

    /// The contents as a plain sorted name to value map.
    pub fn as_map(&self) -> BTreeMap<String, TagValue> {
        self.tags
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// A `TagSetNamespace` over this `TagSet`, for use with format
    /// string rendering. Does not mutate the `TagSet`.
    pub fn ns(&self) -> TagSetNamespace {
        TagSetNamespace::from_tagset(self)
    }

    /// Alias of `ns`, named for its use as `str.format`-style
    /// keyword arguments.
    pub fn format_kwargs(&self) -> TagSetNamespace {
        self.ns()
    }

    /// Round-trip this `TagSet` through a text representation, one
    /// tag per line, for external editing. The edited text tolerates
    /// blank lines and `#` comments. Changes are applied via
    /// `set_from`.
    pub fn edit<F>(&mut self, editor: F) -> Result<()>
    where
        F: FnOnce(&str) -> String,
    {
        let mut lines = vec!["# One tag per line.".to_string()];
        for tag in self.as_tags() {
            lines.push(tag.to_string());
        }
        let text = lines.join("\n");
        let edited = editor(&text);
        let mut new_values = BTreeMap::new();
        for (lineno, line) in edited.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let tag: Tag = line.parse().map_err(|e| match e {
                TagError::Parse { message, offset } => TagError::Parse {
                    message: format!("line {}: {}", lineno + 1, message),
                    offset,
                },
                other => other,
            })?;
            new_values.insert(tag.name().to_string(), tag.value().clone());
        }
        self.set_from(&new_values);
        Ok(())
    }
}

impl PartialEq for TagSet {
    fn eq(&self, other: &Self) -> bool {
        self.tags == other.tags
    }
}
impl Eq for TagSet {}

impl fmt::Display for TagSet {
    /// The `TagSet` suitable for writing to a tag file: sorted tags
    /// joined by single spaces.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for tag in self.as_tags() {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}", tag)?;
            first = false;
        }
        Ok(())
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        let mut tags = TagSet::new();
        for tag in iter {
            tags.add(tag);
        }
        tags
    }
}

impl IntoIterator for &TagSet {
    type Item = Tag;
    type IntoIter = std::vec::IntoIter<Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.as_tags().into_iter()
    }
}
