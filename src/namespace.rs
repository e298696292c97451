use std::collections::BTreeMap;
use std::fmt;

use tracing::warn;

use crate::error::{Result, TagError};
use crate::ontology::TagMetadata;
use crate::tag::{Tag, TagValue};
use crate::tagset::TagSet;

/// A nested, attribute-navigable view over a `TagSet`'s tags for use
/// in format strings: dotted tag names become nested namespace
/// levels, and ontology-aware derived attributes (`_meta`, `_type`,
/// `_keys`, `_values`, case and plural inference) resolve on demand.
#[derive(Debug, Clone, Default)]
pub struct TagSetNamespace {
    path: Vec<String>,
    tag: Option<Tag>,
    placeholder: bool,
    children: BTreeMap<String, TagSetNamespace>,
}

/// The outcome of one attribute lookup.
pub enum Resolved {
    Found(TagSetNamespace),
    Placeholder(TagSetNamespace),
}

impl Resolved {
    pub fn node(self) -> TagSetNamespace {
        match self {
            Resolved::Found(ns) | Resolved::Placeholder(ns) => ns,
        }
    }
}

impl TagSetNamespace {
    /// Compute a presentation of `tags` as a nested namespace.
    ///
    /// Multiple dots in tag names are collapsed: tags named `a.b`,
    /// `a..b` and `..a.b` all map to the namespace entry `a.b`. Tags
    /// are processed in reverse lexical order by name, which dictates
    /// which of the conflicting multidot names binds the entry.
    pub fn from_tagset(tags: &TagSet) -> TagSetNamespace {
        let mut root = TagSetNamespace::default();
        for tag in tags.as_tags().into_iter().rev() {
            let subnames: Vec<&str> =
                tag.name().split('.').filter(|s| !s.is_empty()).collect();
            if subnames.is_empty() {
                warn!(name = tag.name(), "skipping weirdly named tag");
                continue;
            }
            let mut node = &mut root;
            let mut subpath = Vec::new();
            for subname in subnames {
                subpath.push(subname.to_string());
                let path = subpath.clone();
                node = node
                    .children
                    .entry(subname.to_string())
                    .or_insert_with(|| TagSetNamespace { path, ..Default::default() });
            }
            node.tag = Some(tag);
        }
        root
    }

    /// The dotted path of this node; empty at the root.
    pub fn path(&self) -> String {
        self.path.join(".")
    }

    /// The tag bound at this node, if any.
    pub fn tag(&self) -> Option<&Tag> {
        self.tag.as_ref()
    }

    /// The bound tag's value, if any.
    pub fn value(&self) -> Option<&TagValue> {
        self.tag.as_ref().map(Tag::value)
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    /// The public child names.
    pub fn keys(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }

    /// Truthiness for rendering decisions: placeholders are false,
    /// bound tags follow their value, and an unbound node is true
    /// when it has children.
    pub fn truthy(&self) -> bool {
        if self.placeholder {
            return false;
        }
        match self.value() {
            Some(value) => match value {
                TagValue::None => false,
                TagValue::Bool(b) => *b,
                TagValue::Int(i) => *i != 0,
                TagValue::Float(f) => *f != 0.0,
                TagValue::Str(s) => !s.is_empty(),
                TagValue::List(items) => !items.is_empty(),
                TagValue::Map(entries) => !entries.is_empty(),
                _ => true,
            },
            None => !self.children.is_empty(),
        }
    }

    /// Look up `attr` on this node.
    ///
    /// The lookup is a strategy chain evaluated in documented
    /// priority order: special names (`_meta`, `_type`, `_keys`,
    /// `_values`), then actual child entries, then `_lc`-suffix case
    /// conversions, then plural/singular inference in both
    /// directions, and finally a synthesized placeholder. Underscore
    /// names that resolve to nothing are a hard miss (`None`) rather
    /// than a placeholder.
    pub fn resolve(&self, attr: &str) -> Option<Resolved> {
        if let Some(found) = self.resolve_special(attr) {
            return Some(found);
        }
        if attr.starts_with('_') {
            return None;
        }
        if let Some(child) = self.children.get(attr) {
            return Some(Resolved::Found(child.clone()));
        }
        if let Some(found) = self.resolve_case(attr) {
            return Some(found);
        }
        if let Some(found) = self.resolve_plural(attr) {
            return Some(found);
        }
        if attr.chars().next().is_some_and(|c| c.is_alphabetic()) {
            return Some(Resolved::Placeholder(self.placeholder_for(attr)));
        }
        None
    }

    fn resolve_special(&self, attr: &str) -> Option<Resolved> {
        let tag = self.tag.as_ref()?;
        match attr {
            "_type" => {
                let typedata = tag.typedata()?;
                Some(Resolved::Found(TagSetNamespace::from_tagset(&typedata)))
            }
            "_meta" => match tag.metadata(None)? {
                TagMetadata::Scalar(Some(meta)) => {
                    Some(Resolved::Found(TagSetNamespace::from_tagset(&meta.tags)))
                }
                _ => None,
            },
            "_keys" => match tag.value() {
                TagValue::Map(entries) => Some(Resolved::Found(self.derived(
                    attr,
                    TagValue::List(
                        entries.keys().map(|k| TagValue::Str(k.clone())).collect(),
                    ),
                ))),
                _ => None,
            },
            "_values" => match tag.value() {
                TagValue::Map(entries) => Some(Resolved::Found(
                    self.derived(attr, TagValue::List(entries.values().cloned().collect())),
                )),
                _ => None,
            },
            _ => None,
        }
    }

    fn resolve_case(&self, attr: &str) -> Option<Resolved> {
        match attr.strip_suffix("_lc") {
            Some(base) => {
                // the lowercase form of an existing titled entry
                let value = self.children.get(base)?.value()?;
                let TagValue::Str(s) = value else { return None };
                Some(Resolved::Found(self.derived(attr, TagValue::Str(lc_(s)))))
            }
            None => {
                // the titled form of an existing lowercase entry
                let value = self.children.get(&format!("{}_lc", attr))?.value()?;
                let TagValue::Str(s) = value else { return None };
                Some(Resolved::Found(
                    self.derived(attr, TagValue::Str(titleify_lc(s))),
                ))
            }
        }
    }

    fn resolve_plural(&self, attr: &str) -> Option<Resolved> {
        // a plural attribute wraps an existing singular entry
        for suffix in ["s", "es"] {
            if let Some(single) = attr.strip_suffix(suffix) {
                if let Some(value) = self.children.get(single).and_then(|c| c.value()) {
                    return Some(Resolved::Found(
                        self.derived(attr, TagValue::List(vec![value.clone()])),
                    ));
                }
            }
        }
        // a singular attribute takes the first element of an
        // existing plural entry
        for suffix in ["s", "es"] {
            let plural = format!("{}{}", attr, suffix);
            if let Some(TagValue::List(items)) =
                self.children.get(&plural).and_then(|c| c.value())
            {
                if let Some(first) = items.first() {
                    return Some(Resolved::Found(self.derived(attr, first.clone())));
                }
            }
        }
        None
    }

    fn child_path(&self, attr: &str) -> Vec<String> {
        let mut path = self.path.clone();
        path.push(attr.to_string());
        path
    }

    fn derived(&self, attr: &str, value: TagValue) -> TagSetNamespace {
        TagSetNamespace {
            path: self.child_path(attr),
            tag: Some(Tag::unchecked(attr.to_string(), value)),
            placeholder: false,
            children: BTreeMap::new(),
        }
    }

    fn placeholder_for(&self, attr: &str) -> TagSetNamespace {
        let path = self.child_path(attr);
        let text = format!("{{{}}}", path.join("."));
        TagSetNamespace {
            path,
            tag: Some(Tag::unchecked(attr.to_string(), TagValue::Str(text))),
            placeholder: true,
            children: BTreeMap::new(),
        }
    }

    /// Resolve a dotted path from this node. Empty components are
    /// collapsed, mirroring `from_tagset`.
    pub fn resolve_path(&self, dotted: &str) -> Option<Resolved> {
        let mut current = Resolved::Found(self.clone());
        for component in dotted.split('.').filter(|s| !s.is_empty()) {
            current = current.node().resolve(component)?;
        }
        Some(current)
    }

    /// Format this node with a format spec. A node carrying a bound
    /// tag formats its value; otherwise a diagnostic placeholder is
    /// produced.
    pub fn format_with(&self, spec: &str) -> Result<String> {
        match &self.tag {
            Some(tag) => format_value(tag.value(), spec),
            None => {
                let diagnostic = format!(
                    "{{TagSetNamespace:{}[{}]}}",
                    self.path(),
                    self.keys().join(",")
                );
                format_value(&TagValue::Str(diagnostic), spec)
            }
        }
    }

    /// Render a `{a.b.c}`-style template against this namespace.
    /// `{{` and `}}` escape literal braces; `{path:spec}` applies a
    /// format spec. Unresolved paths degrade to visible placeholder
    /// text rather than failing.
    pub fn render(&self, template: &str) -> Result<String> {
        let mut out = String::new();
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut field = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        field.push(c);
                    }
                    if !closed {
                        return Err(TagError::Format(format!(
                            "unterminated replacement field in {:?}",
                            template
                        )));
                    }
                    let (path, spec) = match field.split_once(':') {
                        Some((path, spec)) => (path, spec),
                        None => (field.as_str(), ""),
                    };
                    let node = self
                        .resolve_path(path)
                        .ok_or_else(|| {
                            TagError::Format(format!("no such field {:?}", path))
                        })?
                        .node();
                    out.push_str(&node.format_with(spec)?);
                }
                '}' => {
                    return Err(TagError::Format(format!(
                        "single }} in template {:?}",
                        template
                    )));
                }
                c => out.push(c),
            }
        }
        Ok(out)
    }
}

impl fmt::Display for TagSetNamespace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.format_with("").unwrap_or_default())
    }
}

/// Lowercase `s` with spaces dashed, the inverse of `titleify_lc`.
pub fn lc_(s: &str) -> String {
    s.to_lowercase().replace(' ', "-")
}

/// Undash and title-case `s`, the inverse of `lc_`.
pub fn titleify_lc(s: &str) -> String {
    s.replace('-', " ")
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                None => String::new(),
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format one value with a minimal `[[fill]align][width][.precision]`
/// format spec, the subset the namespace rendering supports.
pub(crate) fn format_value(value: &TagValue, spec: &str) -> Result<String> {
    let (fill, align, width, precision) = parse_spec(spec)?;
    let mut text = match (value, precision) {
        (TagValue::Float(f), Some(p)) => format!("{:.*}", p, f),
        (TagValue::Int(i), Some(p)) => format!("{:.*}", p, *i as f64),
        (TagValue::Str(s), Some(p)) => s.chars().take(p).collect(),
        _ => value.to_string(),
    };
    if let Some(width) = width {
        let len = text.chars().count();
        if len < width {
            let pad: String = std::iter::repeat(fill).take(width - len).collect();
            let numeric = matches!(value, TagValue::Int(_) | TagValue::Float(_));
            text = match align {
                Some('>') => format!("{}{}", pad, text),
                Some('<') => format!("{}{}", text, pad),
                Some('^') => {
                    let left = (width - len) / 2;
                    let right = width - len - left;
                    format!(
                        "{}{}{}",
                        fill.to_string().repeat(left),
                        text,
                        fill.to_string().repeat(right)
                    )
                }
                // numbers right-align by default, text left-aligns
                None if numeric => format!("{}{}", pad, text),
                None => format!("{}{}", text, pad),
                Some(other) => {
                    return Err(TagError::Format(format!("bad alignment {:?}", other)));
                }
            };
        }
    }
    Ok(text)
}

fn parse_spec(spec: &str) -> Result<(char, Option<char>, Option<usize>, Option<usize>)> {
    let mut fill = ' ';
    let mut align = None;
    let mut rest = spec;
    let chars: Vec<char> = spec.chars().collect();
    if chars.len() >= 2 && matches!(chars[1], '<' | '>' | '^') {
        fill = chars[0];
        align = Some(chars[1]);
        rest = &spec[fill.len_utf8() + 1..];
    } else if chars.first().is_some_and(|c| matches!(c, '<' | '>' | '^')) {
        align = Some(chars[0]);
        rest = &spec[1..];
    }
    let (width_part, precision_part) = match rest.split_once('.') {
        Some((w, p)) => (w, Some(p)),
        None => (rest, None),
    };
    let width = if width_part.is_empty() {
        None
    } else {
        Some(width_part.parse().map_err(|_| {
            TagError::Format(format!("bad width in format spec {:?}", spec))
        })?)
    };
    let precision = match precision_part {
        None => None,
        Some(p) => Some(p.trim_end_matches('f').parse().map_err(|_| {
            TagError::Format(format!("bad precision in format spec {:?}", spec))
        })?),
    };
    Ok((fill, align, width, precision))
}
