use std::fmt;
use std::str::FromStr;

use globset::Glob;
use regex::Regex;
// used for internal result sets
use roaring::RoaringTreemap;
use tracing::warn;

use crate::entity::TaggedEntity;
use crate::error::{Result, TagError};
use crate::sqltags::{SqlValue, value_test};
use crate::tag::{Tag, TagValue, get_dotted_identifier};
use crate::tagset::TagSet;

// ------------- IdSet -------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum IdSetMode {
    Empty,
    Single,
    Multi,
}

/// A set of entity ids under construction during a find.
///
/// Most criteria match either nothing or one entity, so the set keeps
/// dedicated small modes before spilling into a roaring bitmap.
#[derive(Debug, Clone)]
pub struct IdSet {
    mode: IdSetMode,
    single: Option<u64>,
    multi: Option<RoaringTreemap>,
}

impl IdSet {
    pub fn new() -> Self {
        Self { mode: IdSetMode::Empty, single: None, multi: None }
    }

    fn empty(&mut self) {
        self.mode = IdSetMode::Empty;
        self.single = None;
        self.multi = None;
    }

    fn single(&mut self, id: u64) {
        self.mode = IdSetMode::Single;
        self.single = Some(id);
        self.multi = None;
    }

    fn multi(&mut self, multi: RoaringTreemap) {
        self.mode = IdSetMode::Multi;
        self.single = None;
        self.multi = Some(multi);
    }

    pub fn push(&mut self, id: u64) {
        match self.mode {
            IdSetMode::Empty => {
                self.single(id);
            }
            IdSetMode::Single => {
                let mut multi = RoaringTreemap::new();
                multi.insert(self.single.unwrap());
                multi.insert(id);
                self.multi(multi);
            }
            IdSetMode::Multi => {
                self.multi.as_mut().unwrap().insert(id);
            }
        }
    }

    pub fn intersect_with(&mut self, other: &IdSet) {
        if self.mode != IdSetMode::Empty {
            match (&self.mode, &other.mode) {
                (_, IdSetMode::Empty) => {
                    self.empty();
                }
                (IdSetMode::Single, IdSetMode::Single) => {
                    if self.single.unwrap() != other.single.unwrap() {
                        self.empty();
                    }
                }
                (IdSetMode::Multi, IdSetMode::Single) => {
                    let other_id = other.single.unwrap();
                    if self.multi.as_ref().unwrap().contains(other_id) {
                        self.single(other_id);
                    } else {
                        self.empty();
                    }
                }
                (IdSetMode::Single, IdSetMode::Multi) => {
                    if !other.multi.as_ref().unwrap().contains(self.single.unwrap()) {
                        self.empty();
                    }
                }
                (IdSetMode::Multi, IdSetMode::Multi) => {
                    *self.multi.as_mut().unwrap() &= other.multi.as_ref().unwrap();
                    match self.multi.as_ref().unwrap().len() {
                        0 => {
                            self.empty();
                        }
                        1 => {
                            let id = self.multi.as_ref().unwrap().min().unwrap();
                            self.single(id);
                        }
                        _ => (),
                    }
                }
                // unreachable: the outer guard ensures self.mode != Empty
                (IdSetMode::Empty, _) => unreachable!(),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mode == IdSetMode::Empty
    }

    pub fn len(&self) -> u64 {
        match self.mode {
            IdSetMode::Empty => 0,
            IdSetMode::Single => 1,
            IdSetMode::Multi => self.multi.as_ref().unwrap().len(),
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        match self.mode {
            IdSetMode::Empty => false,
            IdSetMode::Single => self.single == Some(id),
            IdSetMode::Multi => self.multi.as_ref().unwrap().contains(id),
        }
    }

    /// The ids in ascending order.
    pub fn to_vec(&self) -> Vec<u64> {
        match self.mode {
            IdSetMode::Empty => Vec::new(),
            IdSetMode::Single => vec![self.single.unwrap()],
            IdSetMode::Multi => self.multi.as_ref().unwrap().iter().collect(),
        }
    }
}

impl Default for IdSet {
    fn default() -> Self {
        Self::new()
    }
}

// ------------- Comparison -------------

/// A comparison operator: `=`, `<`, `<=`, `>`, `>=`, `~` (glob) or
/// `~/` (regex search).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Glob,
    Regex,
}

impl Comparison {
    // longer operators first so <= is not read as < followed by =
    const TOKENS: [(&'static str, Comparison); 7] = [
        ("<=", Comparison::Le),
        (">=", Comparison::Ge),
        ("~/", Comparison::Regex),
        ("=", Comparison::Eq),
        ("<", Comparison::Lt),
        (">", Comparison::Gt),
        ("~", Comparison::Glob),
    ];

    fn parse(s: &str, offset: usize) -> Option<(Comparison, usize)> {
        for (token, op) in Self::TOKENS {
            if s[offset..].starts_with(token) {
                return Some((op, offset + token.len()));
            }
        }
        None
    }

    pub fn token(&self) -> &'static str {
        match self {
            Comparison::Eq => "=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Glob => "~",
            Comparison::Regex => "~/",
        }
    }

    /// Apply this comparison to a held tag value and the comparison
    /// value. Incomparable operands are a non-match with a warning,
    /// never an error.
    pub fn apply(&self, tag_value: &TagValue, cmp_value: &TagValue) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Comparison::Eq => tag_value.equals(cmp_value),
            Comparison::Lt | Comparison::Le | Comparison::Gt | Comparison::Ge => {
                match tag_value.compare(cmp_value) {
                    None => {
                        warn!(
                            "cannot order {:?} against {:?}, treating as no match",
                            tag_value, cmp_value
                        );
                        false
                    }
                    Some(ordering) => match self {
                        Comparison::Lt => ordering == Less,
                        Comparison::Le => ordering != Greater,
                        Comparison::Gt => ordering == Greater,
                        Comparison::Ge => ordering != Less,
                        _ => unreachable!(),
                    },
                }
            }
            Comparison::Glob => {
                let Some(pattern) = cmp_value.as_str() else {
                    warn!("glob pattern {:?} is not a string", cmp_value);
                    return false;
                };
                let matcher = match Glob::new(pattern) {
                    Ok(glob) => glob.compile_matcher(),
                    Err(e) => {
                        warn!("bad glob pattern {:?}: {}", pattern, e);
                        return false;
                    }
                };
                match tag_value {
                    TagValue::Str(s) => matcher.is_match(s),
                    // any member of a list value may match;
                    // mapping values are not searched
                    TagValue::List(items) => items
                        .iter()
                        .any(|item| item.as_str().is_some_and(|s| matcher.is_match(s))),
                    _ => false,
                }
            }
            Comparison::Regex => {
                let Some(pattern) = cmp_value.as_str() else {
                    warn!("regexp pattern {:?} is not a string", cmp_value);
                    return false;
                };
                let regexp = match Regex::new(pattern) {
                    Ok(re) => re,
                    Err(e) => {
                        warn!("bad regexp {:?}: {}", pattern, e);
                        return false;
                    }
                };
                match tag_value {
                    // a search, not an anchored match
                    TagValue::Str(s) => regexp.is_match(s),
                    _ => false,
                }
            }
        }
    }
}

// ------------- TagBasedTest -------------

/// A test of one tag: presence of the name, or a comparison of the
/// held value against `comparison`'s value. A false `choice` inverts
/// the result.
#[derive(Debug, Clone)]
pub struct TagBasedTest {
    pub choice: bool,
    pub tag_name: String,
    pub comparison: Option<(Comparison, TagValue)>,
}

impl TagBasedTest {
    fn parse(s: &str, offset: usize, choice: bool) -> Result<(Self, usize)> {
        let (name, mut offset) = get_dotted_identifier(s, offset).ok_or_else(|| {
            TagError::parse("expected dotted identifier tag name", offset)
        })?;
        let mut comparison = None;
        if let Some((op, post_op)) = Comparison::parse(s, offset) {
            let (value, post_value) = Tag::parse_value(s, post_op)?;
            comparison = Some((op, value));
            offset = post_value;
        }
        Ok((Self { choice, tag_name: name.to_string(), comparison }, offset))
    }

    /// Evaluate this test against a `TagSet`. A missing tag is a
    /// non-match, not an error.
    pub fn match_tag_set(&self, tags: &TagSet) -> bool {
        let result = match &self.comparison {
            None => tags.contains_name(&self.tag_name),
            Some((op, cmp_value)) => match tags.get(&self.tag_name) {
                None => false,
                Some(tag_value) => op.apply(tag_value, cmp_value),
            },
        };
        if self.choice { result } else { !result }
    }
}

impl fmt::Display for TagBasedTest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.choice {
            write!(f, "!")?;
        }
        match &self.comparison {
            None => write!(f, "{}", self.tag_name),
            Some((op, value)) => {
                write!(f, "{}{}{}", self.tag_name, op.token(), value.transcribe())
            }
        }
    }
}

// ------------- EntityIdTest -------------

/// A test of the entity id itself: `id:1,2,3`.
#[derive(Debug, Clone)]
pub struct EntityIdTest {
    pub choice: bool,
    pub ids: Vec<i64>,
}

impl EntityIdTest {
    fn parse(s: &str, offset: usize, choice: bool) -> Result<(Self, usize)> {
        if !s[offset..].starts_with("id:") {
            return Err(TagError::parse("expected id: prefix", offset));
        }
        let mut pos = offset + "id:".len();
        let mut ids = Vec::new();
        loop {
            let digits_end = s[pos..]
                .find(|c: char| !c.is_ascii_digit())
                .map(|i| pos + i)
                .unwrap_or(s.len());
            if digits_end == pos {
                return Err(TagError::parse("expected entity id digits", pos));
            }
            ids.push(s[pos..digits_end].parse::<i64>().map_err(|_| {
                TagError::parse(format!("bad entity id {:?}", &s[pos..digits_end]), pos)
            })?);
            pos = digits_end;
            // the list continues only over a comma followed by digits
            if s[pos..].starts_with(',')
                && s[pos + 1..].starts_with(|c: char| c.is_ascii_digit())
            {
                pos += 1;
            } else {
                break;
            }
        }
        Ok((Self { choice, ids }, pos))
    }

    pub fn match_id(&self, id: Option<i64>) -> bool {
        let result = match id {
            None => false,
            Some(id) => self.ids.contains(&id),
        };
        if self.choice { result } else { !result }
    }
}

// ------------- TagSetCriterion -------------

/// One criterion over a tagged entity, parsed from text.
///
/// Parsing is a scan over a fixed, ordered list of criterion shapes;
/// the first shape to parse wins, so the more specific entity-id test
/// is tried before the general tag test.
#[derive(Debug, Clone)]
pub enum TagSetCriterion {
    EntityId(EntityIdTest),
    TagTest(TagBasedTest),
}

impl TagSetCriterion {
    /// Parse one criterion from `s` at `offset`: an optional leading
    /// `!` or `-` negation followed by exactly one recognized shape.
    pub fn parse(s: &str, offset: usize) -> Result<(Self, usize)> {
        let mut offset = offset;
        let mut choice = true;
        if s[offset..].starts_with('!') || s[offset..].starts_with('-') {
            choice = false;
            offset += 1;
        }
        if let Ok((test, post)) = EntityIdTest::parse(s, offset, choice) {
            return Ok((TagSetCriterion::EntityId(test), post));
        }
        let (test, post) = TagBasedTest::parse(s, offset, choice)?;
        Ok((TagSetCriterion::TagTest(test), post))
    }

    /// Evaluate this criterion against an entity.
    pub fn match_entity(&self, entity: &TaggedEntity) -> bool {
        match self {
            TagSetCriterion::EntityId(test) => test.match_id(entity.id),
            TagSetCriterion::TagTest(test) => test.match_tag_set(&entity.tags),
        }
    }

    /// Evaluate this criterion against a bare `TagSet`. An entity-id
    /// test has no id to match and tests false before inversion.
    pub fn match_tag_set(&self, tags: &TagSet) -> bool {
        match self {
            TagSetCriterion::EntityId(test) => test.match_id(None),
            TagSetCriterion::TagTest(test) => test.match_tag_set(tags),
        }
    }

    /// The SQL fragment equivalent to this criterion, for building a
    /// join chain: the joined table, its alias, the column carrying
    /// the entity id, and the constraint with its parameters.
    pub fn sql_fragment(&self, index: usize, prev_entity_id_col: &str) -> SqlFragment {
        match self {
            TagSetCriterion::EntityId(test) => {
                let marks = vec!["?"; test.ids.len()].join(",");
                let filter = if test.choice {
                    format!("e.id IN ({})", marks)
                } else {
                    format!("e.id NOT IN ({})", marks)
                };
                SqlFragment {
                    table: "entities",
                    alias: "e".to_string(),
                    entity_id_column: "e.id".to_string(),
                    join_constraint: None,
                    filter: Some((
                        filter,
                        test.ids.iter().map(|id| SqlValue::Integer(*id)).collect(),
                    )),
                    outer: false,
                }
            }
            TagSetCriterion::TagTest(test) => test.sql_fragment(index, prev_entity_id_col),
        }
    }
}

impl FromStr for TagSetCriterion {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self> {
        let (criterion, offset) = TagSetCriterion::parse(s, 0)?;
        if offset < s.len() {
            return Err(TagError::parse(
                format!("unparsed criterion text {:?}", &s[offset..]),
                offset,
            ));
        }
        Ok(criterion)
    }
}

/// Parse a list of criterion specifications. The list is implicitly
/// AND-ed when evaluated.
pub fn parse_criteria<I, S>(specs: I) -> Result<Vec<TagSetCriterion>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    specs.into_iter().map(|s| s.as_ref().parse()).collect()
}

/// Evaluate AND-ed criteria against one entity.
pub fn match_all(criteria: &[TagSetCriterion], entity: &TaggedEntity) -> bool {
    criteria.iter().all(|c| c.match_entity(entity))
}

// ------------- SQL fragments -------------

/// A criterion rendered as a join-chain fragment.
#[derive(Debug)]
pub struct SqlFragment {
    pub table: &'static str,
    pub alias: String,
    /// The column to join the next fragment on.
    pub entity_id_column: String,
    /// The ON constraint for joined fragments, with its parameters.
    pub join_constraint: Option<(String, Vec<SqlValue>)>,
    /// A WHERE constraint, with its parameters.
    pub filter: Option<(String, Vec<SqlValue>)>,
    pub outer: bool,
}

impl TagBasedTest {
    fn sql_fragment(&self, index: usize, prev_entity_id_col: &str) -> SqlFragment {
        let alias = format!("t{}", index);
        let mut join = format!(
            "{a}.entity_id = {prev} AND {a}.name = ?",
            a = alias,
            prev = prev_entity_id_col
        );
        let mut join_params = vec![SqlValue::Text(self.tag_name.clone())];
        let value_part = self
            .comparison
            .as_ref()
            .map(|(op, value)| value_constraint(&alias, *op, value));
        let mut filter = None;
        if self.choice {
            if let Some((vc, vp)) = value_part {
                join.push_str(&format!(" AND ({})", vc));
                join_params.extend(vp);
            }
        } else {
            // a negative test left-joins and accepts the absent row;
            // COALESCE turns a NULL value comparison into a non-match
            // of the inner constraint, hence a match of the negation
            filter = Some(match value_part {
                None => (format!("{}.id IS NULL", alias), Vec::new()),
                Some((vc, vp)) => (
                    format!("({a}.id IS NULL OR NOT COALESCE(({vc}), 0))", a = alias, vc = vc),
                    vp,
                ),
            });
        }
        SqlFragment {
            table: "tags",
            alias: alias.clone(),
            entity_id_column: format!("{}.entity_id", alias),
            join_constraint: Some((join, join_params)),
            filter,
            outer: !self.choice,
        }
    }
}

fn value_constraint(alias: &str, op: Comparison, value: &TagValue) -> (String, Vec<SqlValue>) {
    match op {
        Comparison::Glob => {
            let pattern = value.as_str().unwrap_or_default().to_string();
            (
                format!(
                    "({a}.string_value GLOB ? OR (json_type(COALESCE({a}.structured_value, 'null')) = 'array' AND EXISTS (\
                     SELECT 1 FROM json_each(COALESCE({a}.structured_value, '[]')) \
                     WHERE json_each.type = 'text' AND json_each.value GLOB ?)))",
                    a = alias
                ),
                vec![SqlValue::Text(pattern.clone()), SqlValue::Text(pattern)],
            )
        }
        Comparison::Regex => {
            let pattern = value.as_str().unwrap_or_default().to_string();
            (
                format!("{}.string_value REGEXP ?", alias),
                vec![SqlValue::Text(pattern)],
            )
        }
        Comparison::Eq | Comparison::Lt | Comparison::Le | Comparison::Gt | Comparison::Ge => {
            let sql_op = match op {
                Comparison::Eq => "=",
                Comparison::Lt => "<",
                Comparison::Le => "<=",
                Comparison::Gt => ">",
                Comparison::Ge => ">=",
                _ => unreachable!(),
            };
            match value_test(value) {
                None => {
                    if op == Comparison::Eq {
                        // equality against a bare value matches a bare tag
                        (
                            format!(
                                "({a}.float_value IS NULL AND {a}.string_value IS NULL \
                                 AND {a}.structured_value IS NULL)",
                                a = alias
                            ),
                            Vec::new(),
                        )
                    } else {
                        // ordering against a bare value never matches
                        ("0".to_string(), Vec::new())
                    }
                }
                Some((column, param)) => (
                    format!("{}.{} {} ?", alias, column, sql_op),
                    vec![param],
                ),
            }
        }
    }
}
