// used for the date and datetime tag value types
use chrono::{NaiveDate, NaiveDateTime};
// uuid values transcribe to their canonical hyphenated form
use uuid::Uuid;
// JSON is the fallback transcription for values without a special form
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

use lazy_static::lazy_static;
use regex::Regex;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::warn;

use crate::error::{Result, TagError};
use crate::ontology::{TagMetadata, TagsOntology};
use crate::tagset::TagSet;

lazy_static! {
    static ref DOTTED_IDENTIFIER: Regex =
        Regex::new(r"^[A-Za-z_]\w*(\.[A-Za-z_]\w*)*").unwrap();
}

/// Test whether `s` is entirely a dotted identifier.
pub fn is_dotted_identifier(s: &str) -> bool {
    match DOTTED_IDENTIFIER.find(s) {
        Some(m) => m.end() == s.len(),
        None => false,
    }
}

/// Match a leading dotted identifier in `s` at `offset`.
/// Return the identifier and the offset of the following text.
pub(crate) fn get_dotted_identifier(s: &str, offset: usize) -> Option<(&str, usize)> {
    let m = DOTTED_IDENTIFIER.find(&s[offset..])?;
    if m.start() != 0 || m.is_empty() {
        return None;
    }
    Some((m.as_str(), offset + m.end()))
}

/// Collect the run of nonwhitespace in `s` at `offset`.
pub(crate) fn get_nonwhite(s: &str, offset: usize) -> (&str, usize) {
    let rest = &s[offset..];
    let end = rest
        .char_indices()
        .find(|(_, c)| c.is_whitespace())
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    (&rest[..end], offset + end)
}

/// Advance `offset` over whitespace.
pub(crate) fn skipwhite(s: &str, offset: usize) -> usize {
    let rest = &s[offset..];
    let end = rest
        .char_indices()
        .find(|(_, c)| !c.is_whitespace())
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    offset + end
}

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

// ------------- TagValue -------------

/// A tag value: any JSON-representable value, `None` for a "bare" tag,
/// or one of the special string-convertible types (uuid, date, datetime).
#[derive(Debug, Clone)]
pub enum TagValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Uuid(Uuid),
    List(Vec<TagValue>),
    Map(BTreeMap<String, TagValue>),
}

impl TagValue {
    pub fn is_none(&self) -> bool {
        matches!(self, TagValue::None)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TagValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Int(i) => Some(*i as f64),
            TagValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Parse the registered special string forms, in registration order.
    /// The first successful parse wins.
    pub fn parse_special(word: &str) -> Option<TagValue> {
        if let Ok(u) = Uuid::parse_str(word) {
            return Some(TagValue::Uuid(u));
        }
        if let Ok(d) = NaiveDate::parse_from_str(word, DATE_FORMAT) {
            return Some(TagValue::Date(d));
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(word, DATETIME_FORMAT) {
            return Some(TagValue::DateTime(dt));
        }
        None
    }

    /// The JSON rendition of this value.
    /// Special types degrade to their canonical string form.
    pub fn to_json(&self) -> JsonValue {
        match self {
            TagValue::None => JsonValue::Null,
            TagValue::Bool(b) => JsonValue::Bool(*b),
            TagValue::Int(i) => JsonValue::from(*i),
            TagValue::Float(f) => {
                serde_json::Number::from_f64(*f).map(JsonValue::Number).unwrap_or(JsonValue::Null)
            }
            TagValue::Str(s) => JsonValue::String(s.clone()),
            TagValue::Date(d) => JsonValue::String(d.format(DATE_FORMAT).to_string()),
            TagValue::DateTime(dt) => {
                JsonValue::String(dt.format(DATETIME_FORMAT).to_string())
            }
            TagValue::Uuid(u) => JsonValue::String(u.to_string()),
            TagValue::List(items) => {
                JsonValue::Array(items.iter().map(TagValue::to_json).collect())
            }
            TagValue::Map(entries) => JsonValue::Object(
                entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    pub fn from_json(value: JsonValue) -> TagValue {
        match value {
            JsonValue::Null => TagValue::None,
            JsonValue::Bool(b) => TagValue::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    TagValue::Int(i)
                } else {
                    TagValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => TagValue::Str(s),
            JsonValue::Array(items) => {
                TagValue::List(items.into_iter().map(TagValue::from_json).collect())
            }
            JsonValue::Object(entries) => TagValue::Map(
                entries.into_iter().map(|(k, v)| (k, TagValue::from_json(v))).collect(),
            ),
        }
    }

    /// Transcribe this value for use in the tag text form.
    /// Mirrors the parse grammar: special types use their canonical
    /// string form, dotted-identifier strings are emitted bare,
    /// everything else is compact JSON.
    pub fn transcribe(&self) -> String {
        match self {
            TagValue::Date(d) => d.format(DATE_FORMAT).to_string(),
            TagValue::DateTime(dt) => dt.format(DATETIME_FORMAT).to_string(),
            TagValue::Uuid(u) => u.to_string(),
            TagValue::Str(s) if is_dotted_identifier(s) => s.clone(),
            other => serde_json::to_string(&other.to_json())
                .unwrap_or_else(|_| "null".to_string()),
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            TagValue::None => 0,
            TagValue::Bool(_) => 1,
            TagValue::Int(_) => 2,
            TagValue::Float(_) => 3,
            TagValue::Str(_) => 4,
            TagValue::Date(_) => 5,
            TagValue::DateTime(_) => 6,
            TagValue::Uuid(_) => 7,
            TagValue::List(_) => 8,
            TagValue::Map(_) => 9,
        }
    }

    /// Equality for criterion tests: numeric across int/float,
    /// structural otherwise.
    pub fn equals(&self, other: &TagValue) -> bool {
        match (self, other) {
            (TagValue::Int(a), TagValue::Float(b)) => (*a as f64) == *b,
            (TagValue::Float(a), TagValue::Int(b)) => *a == (*b as f64),
            _ => self == other,
        }
    }

    /// Ordering for criterion tests.
    /// `None` when the two values are not naturally comparable.
    pub fn compare(&self, other: &TagValue) -> Option<Ordering> {
        match (self, other) {
            (TagValue::Int(a), TagValue::Int(b)) => Some(a.cmp(b)),
            (TagValue::Float(a), TagValue::Float(b)) => a.partial_cmp(b),
            (TagValue::Int(a), TagValue::Float(b)) => (*a as f64).partial_cmp(b),
            (TagValue::Float(a), TagValue::Int(b)) => a.partial_cmp(&(*b as f64)),
            (TagValue::Str(a), TagValue::Str(b)) => Some(a.cmp(b)),
            (TagValue::Date(a), TagValue::Date(b)) => Some(a.cmp(b)),
            (TagValue::DateTime(a), TagValue::DateTime(b)) => Some(a.cmp(b)),
            (TagValue::Uuid(a), TagValue::Uuid(b)) => Some(a.cmp(b)),
            (TagValue::Bool(a), TagValue::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl PartialEq for TagValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TagValue::None, TagValue::None) => true,
            (TagValue::Bool(a), TagValue::Bool(b)) => a == b,
            (TagValue::Int(a), TagValue::Int(b)) => a == b,
            (TagValue::Float(a), TagValue::Float(b)) => a.total_cmp(b) == Ordering::Equal,
            (TagValue::Str(a), TagValue::Str(b)) => a == b,
            (TagValue::Date(a), TagValue::Date(b)) => a == b,
            (TagValue::DateTime(a), TagValue::DateTime(b)) => a == b,
            (TagValue::Uuid(a), TagValue::Uuid(b)) => a == b,
            (TagValue::List(a), TagValue::List(b)) => a == b,
            (TagValue::Map(a), TagValue::Map(b)) => a == b,
            _ => false,
        }
    }
}
impl Eq for TagValue {}

// Structural total order so that tags sort deterministically.
impl Ord for TagValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (TagValue::Bool(a), TagValue::Bool(b)) => a.cmp(b),
            (TagValue::Int(a), TagValue::Int(b)) => a.cmp(b),
            (TagValue::Float(a), TagValue::Float(b)) => a.total_cmp(b),
            (TagValue::Str(a), TagValue::Str(b)) => a.cmp(b),
            (TagValue::Date(a), TagValue::Date(b)) => a.cmp(b),
            (TagValue::DateTime(a), TagValue::DateTime(b)) => a.cmp(b),
            (TagValue::Uuid(a), TagValue::Uuid(b)) => a.cmp(b),
            (TagValue::List(a), TagValue::List(b)) => a.cmp(b),
            (TagValue::Map(a), TagValue::Map(b)) => a.cmp(b),
            _ => self.kind_rank().cmp(&other.kind_rank()),
        }
    }
}
impl PartialOrd for TagValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TagValue::None => write!(f, ""),
            TagValue::Str(s) => write!(f, "{}", s),
            other => write!(f, "{}", other.transcribe()),
        }
    }
}

impl Serialize for TagValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TagValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(TagValue::from_json(JsonValue::deserialize(deserializer)?))
    }
}

impl From<&str> for TagValue {
    fn from(s: &str) -> Self { TagValue::Str(s.to_string()) }
}
impl From<String> for TagValue {
    fn from(s: String) -> Self { TagValue::Str(s) }
}
impl From<i64> for TagValue {
    fn from(i: i64) -> Self { TagValue::Int(i) }
}
impl From<f64> for TagValue {
    fn from(f: f64) -> Self { TagValue::Float(f) }
}
impl From<bool> for TagValue {
    fn from(b: bool) -> Self { TagValue::Bool(b) }
}
impl From<NaiveDate> for TagValue {
    fn from(d: NaiveDate) -> Self { TagValue::Date(d) }
}
impl From<NaiveDateTime> for TagValue {
    fn from(dt: NaiveDateTime) -> Self { TagValue::DateTime(dt) }
}
impl From<Uuid> for TagValue {
    fn from(u: Uuid) -> Self { TagValue::Uuid(u) }
}
impl From<Vec<TagValue>> for TagValue {
    fn from(items: Vec<TagValue>) -> Self { TagValue::List(items) }
}

// ------------- Tag -------------

/// A `Tag` has a name, a value and an optional shared ontology.
///
/// The name must be a dotted identifier. A "bare" tag has a value of
/// `TagValue::None`. Tags are immutable once constructed; a changed
/// tag is a new instance. Equality and ordering consider only
/// `(name, value)` - the ontology reference is a non-owning share.
#[derive(Debug, Clone)]
pub struct Tag {
    name: String,
    value: TagValue,
    ontology: Option<Arc<TagsOntology>>,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<TagValue>) -> Result<Self> {
        let name = name.into();
        if !is_dotted_identifier(&name) {
            return Err(TagError::parse(
                format!("invalid tag name {:?}: not a dotted identifier", name),
                0,
            ));
        }
        Ok(Self { name, value: value.into(), ontology: None })
    }

    /// A bare tag: a name with no value.
    pub fn bare(name: impl Into<String>) -> Result<Self> {
        Self::new(name, TagValue::None)
    }

    // Names built from validated dotted identifiers skip revalidation.
    pub(crate) fn unchecked(name: String, value: TagValue) -> Self {
        Self { name, value, ontology: None }
    }

    /// A copy of this tag referencing `ontology`.
    pub fn with_ontology(&self, ontology: Option<Arc<TagsOntology>>) -> Self {
        Self { name: self.name.clone(), value: self.value.clone(), ontology }
    }

    /// A tag whose name carries an additional `prefix.` prefix.
    pub fn prefix_name(&self, prefix: &str) -> Self {
        if prefix.is_empty() {
            return self.clone();
        }
        Self {
            name: format!("{}.{}", prefix, self.name),
            value: self.value.clone(),
            ontology: self.ontology.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn value(&self) -> &TagValue {
        &self.value
    }
    pub fn ontology(&self) -> Option<&Arc<TagsOntology>> {
        self.ontology.as_ref()
    }

    /// Test whether this tag matches `(name, value)`.
    /// A `None` value matches on name alone.
    pub fn matches(&self, name: &str, value: Option<&TagValue>) -> bool {
        if self.name != name {
            return false;
        }
        match value {
            None => true,
            Some(v) => self.value == *v,
        }
    }

    /// Parse `name[=value]` from `s` at `offset`.
    /// Return the tag and the offset of the following text.
    ///
    /// A bare name followed by a separator that is neither `=` nor
    /// whitespace collects the remaining run of nonwhitespace into the
    /// name rather than failing outright.
    pub fn parse(s: &str, offset: usize) -> Result<(Tag, usize)> {
        let (name, mut offset) = get_dotted_identifier(s, offset).ok_or_else(|| {
            TagError::parse("expected dotted identifier tag name", offset)
        })?;
        let mut name = name.to_string();
        let mut value = TagValue::None;
        if offset < s.len() {
            let sep = s[offset..].chars().next().unwrap();
            if sep == '=' {
                offset += 1;
                let (v, post_offset) = Self::parse_value(s, offset)?;
                value = v;
                offset = post_offset;
            } else if !sep.is_whitespace() {
                // permissive trailing-text recovery
                let (name_end, post_offset) = get_nonwhite(s, offset);
                name.push_str(name_end);
                offset = post_offset;
            }
        }
        Ok((Tag::unchecked(name, value), offset))
    }

    /// Parse a value from `s` at `offset`, as found after `name=`.
    ///
    /// The grammar is tried in order: a bare dotted-identifier word is
    /// kept as a literal string; a run of nonwhitespace is tested
    /// against the special types in registration order; otherwise the
    /// text is decoded as JSON from the current offset, consuming only
    /// as much as a valid JSON value requires.
    pub fn parse_value(s: &str, offset: usize) -> Result<(TagValue, usize)> {
        if offset >= s.len() || s[offset..].starts_with(char::is_whitespace) {
            warn!(offset, "missing value part");
            return Ok((TagValue::None, offset));
        }
        let (nonwhite, nw_offset) = get_nonwhite(s, offset);
        if is_dotted_identifier(nonwhite) {
            return Ok((TagValue::Str(nonwhite.to_string()), nw_offset));
        }
        if let Some(special) = TagValue::parse_special(nonwhite) {
            return Ok((special, nw_offset));
        }
        let mut stream =
            serde_json::Deserializer::from_str(&s[offset..]).into_iter::<JsonValue>();
        match stream.next() {
            Some(Ok(json)) => {
                let consumed = stream.byte_offset();
                Ok((TagValue::from_json(json), offset + consumed))
            }
            _ => Err(TagError::parse(
                format!("invalid value text {:?}", nonwhite),
                offset,
            )),
        }
    }

    /// The defining `TagSet` for this tag's name, from the ontology.
    /// Soft-fails with a warning when no ontology is attached.
    pub fn typedata(&self) -> Option<TagSet> {
        match &self.ontology {
            None => {
                warn!(tag = %self, "no ontology, returning None");
                None
            }
            Some(ont) => Some(ont.typedef(&self.name)),
        }
    }

    /// The type name for this tag: the typedata's own `type` tag if
    /// set, else the tag's own name normalized via `value_to_tag_name`.
    pub fn type_name(&self) -> Option<String> {
        let typedata = self.typedata()?;
        if let Some(TagValue::Str(type_name)) = typedata.get("type") {
            return Some(type_name.clone());
        }
        TagsOntology::value_to_tag_name(&TagValue::Str(self.name.clone())).ok()
    }

    /// The base type name for this tag, resolved through the
    /// ontology's `type=` chain. Soft-fails to `None` without an
    /// ontology.
    pub fn basetype(&self) -> Option<String> {
        let ont = match &self.ontology {
            None => {
                warn!(tag = %self, "no ontology, returning None");
                return None;
            }
            Some(ont) => ont,
        };
        Some(ont.basetype(&self.type_name()?))
    }

    /// The typedata for this tag's keys, per its `key_type`.
    pub fn key_typedata(&self) -> Option<TagSet> {
        let key_type = self.typedata()?.get_str("key_type")?;
        Some(self.ontology.as_ref()?.typedef(&key_type))
    }

    /// The typedata for this tag's members, per its `member_type`.
    pub fn member_typedata(&self) -> Option<TagSet> {
        let member_type = self.typedata()?.get_str("member_type")?;
        Some(self.ontology.as_ref()?.typedef(&member_type))
    }

    /// Metadata for one key of a mapping-valued tag.
    pub fn key_metadata(&self, key: &str) -> Option<crate::ontology::ValueMetadata> {
        let key_type = self.typedata()?.get_str("key_type")?;
        self.ontology.as_ref()?.value_metadata(&key_type, &TagValue::Str(key.to_string()), None)
    }

    /// Metadata for one member of a list- or mapping-valued tag.
    pub fn member_metadata(&self, member_key: &TagValue) -> Option<crate::ontology::ValueMetadata> {
        let member_type = self.typedata()?.get_str("member_type")?;
        let member_value = match (&self.value, member_key) {
            (TagValue::List(items), TagValue::Int(i)) => {
                items.get(usize::try_from(*i).ok()?)?.clone()
            }
            (TagValue::Map(entries), TagValue::Str(k)) => entries.get(k)?.clone(),
            _ => return None,
        };
        self.ontology.as_ref()?.value_metadata(&member_type, &member_value, None)
    }

    /// The metadata about this specific tag value, derived through the
    /// ontology from the tag name and value.
    ///
    /// For `list` and `dict` base types the members (and keys) are
    /// resolved individually; for scalar types this is a single
    /// `value_metadata` lookup keyed by the tag's own name.
    pub fn metadata(&self, convert: Option<&dyn Fn(&TagValue) -> Option<String>>) -> Option<TagMetadata> {
        let ont = self.ontology.as_ref()?;
        let basetype = self.basetype()?;
        match basetype.as_str() {
            "list" => {
                let member_type = self.typedata()?.get_str("member_type")?;
                let TagValue::List(items) = &self.value else {
                    return None;
                };
                Some(TagMetadata::List(
                    items
                        .iter()
                        .map(|v| ont.value_metadata(&member_type, v, convert))
                        .collect(),
                ))
            }
            "dict" => {
                let typedata = self.typedata()?;
                let key_type = typedata.get_str("key_type")?;
                let member_type = typedata.get_str("member_type")?;
                let TagValue::Map(entries) = &self.value else {
                    return None;
                };
                Some(TagMetadata::Map(
                    entries
                        .iter()
                        .map(|(k, v)| {
                            (
                                ont.value_metadata(
                                    &key_type,
                                    &TagValue::Str(k.clone()),
                                    convert,
                                ),
                                ont.value_metadata(&member_type, v, convert),
                            )
                        })
                        .collect(),
                ))
            }
            _ => Some(TagMetadata::Scalar(ont.value_metadata(
                &self.name,
                &self.value,
                convert,
            ))),
        }
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value
    }
}
impl Eq for Tag {}

impl Ord for Tag {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.name, &self.value).cmp(&(&other.name, &other.value))
    }
}
impl PartialOrd for Tag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.value.is_none() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}={}", self.name, self.value.transcribe())
        }
    }
}

impl FromStr for Tag {
    type Err = TagError;

    /// Parse a complete tag from `s`, requiring the whole string to be
    /// consumed.
    fn from_str(s: &str) -> Result<Tag> {
        let (tag, offset) = Tag::parse(s, 0)?;
        if offset < s.len() {
            return Err(TagError::parse(
                format!("unparsed text after tag {}: {:?}", tag, &s[offset..]),
                offset,
            ));
        }
        Ok(tag)
    }
}
