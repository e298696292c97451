use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use uuid::Uuid;

use tagbase::tag::{Tag, TagValue};

fn round_trip(tag: &Tag) -> Tag {
    tag.to_string().parse().expect("tag text should parse back")
}

#[test]
fn bare_tag_is_name_alone() {
    let tag = Tag::bare("blue").unwrap();
    assert_eq!(tag.to_string(), "blue");
    let back = round_trip(&tag);
    assert_eq!(back.name(), "blue");
    assert_eq!(*back.value(), TagValue::None);
}

#[test]
fn int_round_trip() {
    let tag = Tag::new("count", 3i64).unwrap();
    assert_eq!(tag.to_string(), "count=3");
    assert_eq!(*round_trip(&tag).value(), TagValue::Int(3));
    let negative = Tag::new("delta", -7i64).unwrap();
    assert_eq!(negative.to_string(), "delta=-7");
    assert_eq!(*round_trip(&negative).value(), TagValue::Int(-7));
}

#[test]
fn float_round_trip() {
    let tag = Tag::new("ratio", 0.5f64).unwrap();
    assert_eq!(tag.to_string(), "ratio=0.5");
    assert_eq!(*round_trip(&tag).value(), TagValue::Float(0.5));
}

#[test]
fn bare_word_string_stays_bare() {
    let tag = Tag::new("topic", "tagging").unwrap();
    assert_eq!(tag.to_string(), "topic=tagging");
    assert_eq!(*round_trip(&tag).value(), TagValue::Str("tagging".to_string()));
}

#[test]
fn nonidentifier_string_is_json_quoted() {
    let tag = Tag::new("title", "Avengers Assemble").unwrap();
    assert_eq!(tag.to_string(), "title=\"Avengers Assemble\"");
    assert_eq!(
        *round_trip(&tag).value(),
        TagValue::Str("Avengers Assemble".to_string())
    );
}

#[test]
fn list_round_trip_is_compact_json() {
    let tag = Tag::new(
        "cast",
        TagValue::List(vec![
            TagValue::Str("a b".to_string()),
            TagValue::Int(2),
        ]),
    )
    .unwrap();
    assert_eq!(tag.to_string(), "cast=[\"a b\",2]");
    assert_eq!(round_trip(&tag).value(), tag.value());
}

#[test]
fn dict_round_trip() {
    let mut entries = BTreeMap::new();
    entries.insert("b".to_string(), TagValue::Int(1));
    entries.insert("a".to_string(), TagValue::Int(2));
    let tag = Tag::new("index", TagValue::Map(entries)).unwrap();
    assert_eq!(tag.to_string(), "index={\"a\":2,\"b\":1}");
    assert_eq!(round_trip(&tag).value(), tag.value());
}

#[test]
fn uuid_round_trip() {
    let uuid = Uuid::parse_str("65f061ff-389b-44f5-a2a1-9b788ba10b63").unwrap();
    let tag = Tag::new("ident", uuid).unwrap();
    assert_eq!(tag.to_string(), "ident=65f061ff-389b-44f5-a2a1-9b788ba10b63");
    assert_eq!(*round_trip(&tag).value(), TagValue::Uuid(uuid));
}

#[test]
fn date_and_datetime_round_trip() {
    let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
    let tag = Tag::new("when", date).unwrap();
    assert_eq!(tag.to_string(), "when=2024-01-02");
    assert_eq!(*round_trip(&tag).value(), TagValue::Date(date));

    let datetime: NaiveDateTime = date.and_hms_opt(3, 4, 5).unwrap();
    let tag = Tag::new("stamp", datetime).unwrap();
    assert_eq!(tag.to_string(), "stamp=2024-01-02T03:04:05");
    assert_eq!(*round_trip(&tag).value(), TagValue::DateTime(datetime));
}

#[test]
fn special_types_parse_in_registration_order() {
    assert!(matches!(
        TagValue::parse_special("65f061ff-389b-44f5-a2a1-9b788ba10b63"),
        Some(TagValue::Uuid(_))
    ));
    assert!(matches!(
        TagValue::parse_special("2024-01-02"),
        Some(TagValue::Date(_))
    ));
    assert!(matches!(
        TagValue::parse_special("2024-01-02T03:04:05"),
        Some(TagValue::DateTime(_))
    ));
    assert_eq!(TagValue::parse_special("plainword"), None);
}

#[test]
fn bad_name_is_rejected() {
    assert!(Tag::bare("9lives").is_err());
    assert!(Tag::bare("a..b").is_err());
    assert!("=5".parse::<Tag>().is_err());
}

#[test]
fn trailing_text_recovery_extends_the_name() {
    // a non-=, non-whitespace separator folds the rest of the run
    // into the name instead of failing
    let (tag, offset) = Tag::parse("colour-ish rest", 0).unwrap();
    assert_eq!(tag.name(), "colour-ish");
    assert_eq!(*tag.value(), TagValue::None);
    assert_eq!(&"colour-ish rest"[offset..], " rest");
}

#[test]
fn whole_string_must_be_consumed() {
    assert!("colour=blue extra".parse::<Tag>().is_err());
    assert!("colour=blue".parse::<Tag>().is_ok());
}

#[test]
fn missing_value_after_equals_is_bare() {
    let tag: Tag = "colour=".parse().unwrap();
    assert_eq!(tag.name(), "colour");
    assert_eq!(*tag.value(), TagValue::None);
}

#[test]
fn json_decode_consumes_only_one_value() {
    let (tag, offset) = Tag::parse("xs=[1,2]tail", 0).unwrap();
    assert_eq!(
        *tag.value(),
        TagValue::List(vec![TagValue::Int(1), TagValue::Int(2)])
    );
    assert_eq!(&"xs=[1,2]tail"[offset..], "tail");
}

#[test]
fn equality_and_ordering_use_name_then_value() {
    let a1 = Tag::new("a", 1i64).unwrap();
    let a2 = Tag::new("a", 2i64).unwrap();
    let b1 = Tag::new("b", 1i64).unwrap();
    assert_eq!(a1, Tag::new("a", 1i64).unwrap());
    assert_ne!(a1, a2);
    assert!(a1 < a2);
    assert!(a2 < b1);
}

#[test]
fn matches_tests_name_and_optional_value() {
    let tag = Tag::new("subtopic", "ontologies").unwrap();
    assert!(tag.matches("subtopic", None));
    assert!(tag.matches("subtopic", Some(&TagValue::Str("ontologies".to_string()))));
    assert!(!tag.matches("subtopic", Some(&TagValue::Str("libraries".to_string()))));
    assert!(!tag.matches("topic", None));
}

#[test]
fn prefix_name_prepends_dotted_prefix() {
    let tag = Tag::new("lead", "Alice").unwrap().prefix_name("cast");
    assert_eq!(tag.name(), "cast.lead");
    assert_eq!(tag.to_string(), "cast.lead=Alice");
}
