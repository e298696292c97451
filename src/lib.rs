//! Tagbase – typed tags, tag sets and ontologies with criterion search.
//!
//! Tagbase centers on three constructs:
//! * A [`tag::Tag`] is an immutable `(name, value)` pair with an optional
//!   shared ontology reference. Names are dotted identifiers; values are
//!   JSON-representable plus a few special string-convertible types
//!   (uuid, date, datetime). Tags parse from and transcribe to a compact
//!   text form, `name[=value]`.
//! * A [`tagset::TagSet`] maps tag names to values, with set-like
//!   `set`/`discard` mutators, change tracking, and a line text form that
//!   round-trips.
//! * A [`ontology::TagsOntology`] maps `type.*` and `meta.*` keys to
//!   `TagSet`s over a pluggable backing store, giving tags types, base
//!   types and per-value metadata.
//!
//! Around these sit:
//! * [`criterion`] – composable predicates parsed from text
//!   (`name`, `name=value`, `name~glob`, `-name`, `id:1,2`), evaluated
//!   in memory or compiled to SQL join fragments.
//! * [`entity`] – tagged entity records, an in-memory entity keeper and
//!   the CSV interop row `unixtime,id,name,tag...`.
//! * [`sqltags`] – the SQLite store for entities and tags, whose
//!   criterion queries agree exactly with in-memory evaluation.
//! * [`namespace`] – a nested namespace projection of a `TagSet` for
//!   `{a.b.c}`-style template rendering, with ontology-aware derived
//!   attributes and graceful placeholder degradation.
//!
//! ## Quick Start
//! ```
//! use tagbase::tagset::TagSet;
//! use tagbase::criterion::TagSetCriterion;
//!
//! let tags = TagSet::from_line("blue topic=tagging priority=2", None).unwrap();
//! assert_eq!(tags.to_string(), "blue priority=2 topic=tagging");
//! let wanted: TagSetCriterion = "priority>=2".parse().unwrap();
//! assert!(wanted.match_tag_set(&tags));
//! ```
//!
//! ## Concurrency
//! Each `TagSet` and `TagsOntology` is designed for single-threaded,
//! synchronous use. Stores shared between owners serialize mutation on
//! one coarse lock per store instance; the ontology and criterion logic
//! itself performs no I/O.

pub mod criterion;
pub mod entity;
pub mod error;
pub mod namespace;
pub mod ontology;
pub mod sqltags;
pub mod tag;
pub mod tagset;
