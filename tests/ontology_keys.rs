use std::sync::Arc;

use tagbase::ontology::{MemoryTagSets, TagsOntology};
use tagbase::tag::{Tag, TagValue};
use tagbase::tagset::TagSet;

fn ont() -> Arc<TagsOntology> {
    Arc::new(TagsOntology::new(MemoryTagSets::new()))
}

fn str_value(s: &str) -> TagValue {
    TagValue::Str(s.to_string())
}

#[test]
fn key_construction_invariants() {
    assert_eq!(TagsOntology::type_index("colour"), "type.colour");
    assert_eq!(
        TagsOntology::meta_index("colour", &str_value("Captain America (Marvel)")).unwrap(),
        "meta.colour.marvel.captain_america"
    );
}

#[test]
fn value_to_tag_name_cases() {
    assert_eq!(
        TagsOntology::value_to_tag_name(&TagValue::Int(0)).unwrap(),
        "0"
    );
    assert_eq!(
        TagsOntology::value_to_tag_name(&TagValue::Int(42)).unwrap(),
        "42"
    );
    assert!(TagsOntology::value_to_tag_name(&TagValue::Int(-1)).is_err());
    assert!(TagsOntology::value_to_tag_name(&TagValue::Bool(true)).is_err());
    assert_eq!(
        TagsOntology::value_to_tag_name(&str_value("Black Widow (Marvel)")).unwrap(),
        "marvel.black_widow"
    );
    assert_eq!(
        TagsOntology::value_to_tag_name(&str_value("  Spaced   Out  ")).unwrap(),
        "spaced_out"
    );
    assert_eq!(
        TagsOntology::value_to_tag_name(&str_value("plain")).unwrap(),
        "plain"
    );
}

// a tiny deterministic generator, enough to sweep word/space/suffix
// combinations without a fixtures file
fn lcg(seed: &mut u64) -> u64 {
    *seed = seed
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    *seed >> 16
}

#[test]
fn value_to_tag_name_always_yields_a_dotted_name() {
    const CHARS: &[u8] = b"abXYz019_";
    let mut seed = 0x9e3779b97f4a7c15u64;
    for _ in 0..500 {
        let word_count = 1 + (lcg(&mut seed) % 3) as usize;
        let mut words = Vec::new();
        for _ in 0..word_count {
            let len = 1 + (lcg(&mut seed) % 8) as usize;
            let word: String = (0..len)
                .map(|_| CHARS[(lcg(&mut seed) % CHARS.len() as u64) as usize] as char)
                .collect();
            words.push(word);
        }
        let mut text = words.join(&" ".repeat(1 + (lcg(&mut seed) % 3) as usize));
        if lcg(&mut seed) % 2 == 0 {
            text.push_str(" (Suffix Word)");
        }
        let name = TagsOntology::value_to_tag_name(&str_value(&text)).unwrap();
        assert!(!name.is_empty(), "empty name from {:?}", text);
        for component in name.split('.') {
            assert!(!component.is_empty(), "{:?} from {:?}", name, text);
            assert!(
                component.chars().all(|c| c.is_alphanumeric() || c == '_'),
                "{:?} from {:?}",
                name,
                text
            );
        }
    }
}

#[test]
fn typedef_missing_is_empty_not_an_error() {
    let ont = ont();
    let typedata = ont.typedef("nonesuch");
    assert!(typedata.is_empty());
}

#[test]
fn basetype_follows_the_type_chain() {
    let ont = ont();
    ont.define("type.colour", "type=str").unwrap();
    ont.define("type.shade", "type=colour").unwrap();
    ont.define("type.count", "type=int").unwrap();
    assert_eq!(ont.basetype("colour"), "str");
    assert_eq!(ont.basetype("shade"), "str");
    assert_eq!(ont.basetype("count"), "int");
    assert_eq!(ont.basetype("int"), "int");
    // an undeclared name defaults to str
    assert_eq!(ont.basetype("mystery"), "str");
}

#[test]
fn basetype_cycle_falls_back_to_str() {
    let ont = ont();
    ont.define("type.a", "type=b").unwrap();
    ont.define("type.b", "type=a").unwrap();
    ont.define("type.selfish", "type=selfish").unwrap();
    // a cyclic chain is broken with a warning and the unresolved
    // name then falls back to str like any other non-base name
    assert_eq!(ont.basetype("a"), "str");
    assert_eq!(ont.basetype("selfish"), "str");
}

#[test]
fn value_metadata_resolves_the_meta_entry() {
    let ont = ont();
    ont.define("meta.character.marvel.black_widow", "fullname=\"Natasha Romanoff\"")
        .unwrap();
    let meta = ont
        .value_metadata("character", &str_value("Black Widow (Marvel)"), None)
        .expect("string values resolve");
    assert_eq!(meta.ontkey, "meta.character.marvel.black_widow");
    assert_eq!(
        meta.tags.get("fullname"),
        Some(&str_value("Natasha Romanoff"))
    );
    // a caller-supplied convert overrides the normalization
    let convert = |_: &TagValue| Some("custom_key".to_string());
    let meta = ont
        .value_metadata("character", &str_value("whatever"), Some(&convert))
        .unwrap();
    assert_eq!(meta.ontkey, "meta.character.custom_key");
    // unconvertible values soft-fail
    assert!(ont.value_metadata("character", &TagValue::Bool(true), None).is_none());
}

#[test]
fn enumerations_strip_their_prefixes() {
    let ont = ont();
    ont.define("type.colour", "type=str").unwrap();
    ont.define("type.series", "").unwrap();
    ont.define("meta.colour.blue", "wavelength=470").unwrap();
    ont.define("meta.series.marvel.avengers", "").unwrap();
    let type_names: Vec<String> = ont.type_names().collect();
    assert_eq!(type_names, vec!["colour", "series"]);
    let types: Vec<(String, TagSet)> = ont.types().collect();
    assert_eq!(types[0].0, "colour");
    assert_eq!(types[0].1.get_str("type"), Some("str".to_string()));
    let all_meta: Vec<String> = ont.meta_names(None).collect();
    assert_eq!(all_meta, vec!["colour.blue", "series.marvel.avengers"]);
    let colour_meta: Vec<String> = ont.meta_names(Some("colour")).collect();
    assert_eq!(colour_meta, vec!["blue"]);
}

#[test]
fn convert_tag_coerces_by_basetype() {
    let ont = ont();
    ont.define("type.count", "type=int").unwrap();
    ont.define("type.when", "type=date").unwrap();
    let converted = ont.convert_tag(&Tag::new("count", "42").unwrap());
    assert_eq!(*converted.value(), TagValue::Int(42));
    let converted = ont.convert_tag(&Tag::new("when", "2024-01-02").unwrap());
    assert!(matches!(converted.value(), TagValue::Date(_)));
    // an unparseable value is left alone
    let converted = ont.convert_tag(&Tag::new("count", "many").unwrap());
    assert_eq!(*converted.value(), str_value("many"));
    // a str-typed tag is left alone
    let converted = ont.convert_tag(&Tag::new("title", "42").unwrap());
    assert_eq!(*converted.value(), str_value("42"));
}

#[test]
fn edit_indices_updates_and_renames() {
    let ont = ont();
    ont.define("meta.colour.blue", "wavelength=470").unwrap();
    ont.define("meta.colour.red", "wavelength=700").unwrap();
    let indices = vec![
        "meta.colour.blue".to_string(),
        "meta.colour.red".to_string(),
    ];
    let renamed = ont
        .edit_indices(&indices, None, |text| {
            assert!(text.contains("meta.colour.blue wavelength=470"));
            "meta.colour.blue wavelength=470 hue=cool\nmeta.colour.crimson wavelength=700\n"
                .to_string()
        })
        .unwrap();
    assert_eq!(
        renamed,
        vec![("meta.colour.red".to_string(), "meta.colour.crimson".to_string())]
    );
    assert!(ont.get_entry("meta.colour.red").is_none());
    let crimson = ont.get_entry("meta.colour.crimson").unwrap();
    assert_eq!(crimson.get("wavelength"), Some(&TagValue::Int(700)));
    let blue = ont.get_entry("meta.colour.blue").unwrap();
    assert_eq!(blue.get_str("hue"), Some("cool".to_string()));
}

#[test]
fn edit_indices_refuses_colliding_renames() {
    let ont = ont();
    ont.define("meta.colour.blue", "wavelength=470").unwrap();
    ont.define("meta.colour.red", "wavelength=700").unwrap();
    let indices = vec![
        "meta.colour.blue".to_string(),
        "meta.colour.red".to_string(),
    ];
    let renamed = ont
        .edit_indices(&indices, None, |_| {
            "meta.colour.mud wavelength=470\nmeta.colour.mud wavelength=700\n".to_string()
        })
        .unwrap();
    assert!(renamed.is_empty());
    // neither entry was renamed and both originals are intact
    assert_eq!(
        ont.get_entry("meta.colour.blue").unwrap().get("wavelength"),
        Some(&TagValue::Int(470))
    );
    assert_eq!(
        ont.get_entry("meta.colour.red").unwrap().get("wavelength"),
        Some(&TagValue::Int(700))
    );
    assert!(ont.get_entry("meta.colour.mud").is_none());
}

#[test]
fn edit_indices_with_prefix_strips_and_restores() {
    let ont = ont();
    ont.define("meta.colour.blue", "wavelength=470").unwrap();
    let indices = vec!["meta.colour.blue".to_string()];
    let renamed = ont
        .edit_indices(&indices, Some("meta.colour"), |text| {
            assert_eq!(text, "blue wavelength=470");
            "azure wavelength=470".to_string()
        })
        .unwrap();
    assert_eq!(
        renamed,
        vec![("meta.colour.blue".to_string(), "meta.colour.azure".to_string())]
    );
    assert!(ont.get_entry("meta.colour.azure").is_some());
}

#[test]
fn tag_type_defaults_to_its_normalized_name() {
    let ont = ont();
    // a type entry with no type= override
    ont.put_entry("type.series", TagSet::new());
    let tags = TagSet::from_line(
        "title=\"Avengers Assemble\" series=\"Avengers (Marvel)\"",
        Some(Arc::clone(&ont)),
    )
    .unwrap();
    let series = Tag::new("series", tags.get("series").unwrap().clone())
        .unwrap()
        .with_ontology(Some(Arc::clone(&ont)));
    assert_eq!(series.type_name(), Some("series".to_string()));
    // with an explicit type= tag the override wins
    ont.define("type.series", "type=str").unwrap();
    assert_eq!(series.type_name(), Some("str".to_string()));
}

#[test]
fn tag_lookups_soft_fail_without_an_ontology() {
    let naive = Tag::new("colour", "blue").unwrap();
    assert!(naive.typedata().is_none());
    assert!(naive.basetype().is_none());
    assert!(naive.metadata(None).is_none());
}

#[test]
fn tag_metadata_maps_list_members() {
    let ont = ont();
    ont.define("type.cast", "type=list member_type=character").unwrap();
    ont.define("meta.character.marvel.black_widow", "kind=spy").unwrap();
    let tag = Tag::new(
        "cast",
        TagValue::List(vec![str_value("Black Widow (Marvel)")]),
    )
    .unwrap()
    .with_ontology(Some(Arc::clone(&ont)));
    assert_eq!(tag.basetype(), Some("list".to_string()));
    match tag.metadata(None) {
        Some(tagbase::ontology::TagMetadata::List(members)) => {
            assert_eq!(members.len(), 1);
            let meta = members[0].as_ref().unwrap();
            assert_eq!(meta.ontkey, "meta.character.marvel.black_widow");
            assert_eq!(meta.tags.get_str("kind"), Some("spy".to_string()));
        }
        other => panic!("expected list metadata, got {:?}", other),
    }
}

#[test]
fn tag_metadata_maps_dict_keys_and_members() {
    let ont = ont();
    ont.define("type.cast", "type=dict key_type=person member_type=character")
        .unwrap();
    ont.define("meta.person.scarlett_johansson", "").unwrap();
    ont.define("meta.character.marvel.black_widow", "kind=spy").unwrap();
    let mut entries = std::collections::BTreeMap::new();
    entries.insert(
        "Scarlett Johansson".to_string(),
        str_value("Black Widow (Marvel)"),
    );
    let tag = Tag::new("cast", TagValue::Map(entries))
        .unwrap()
        .with_ontology(Some(Arc::clone(&ont)));
    assert_eq!(tag.basetype(), Some("dict".to_string()));
    match tag.metadata(None) {
        Some(tagbase::ontology::TagMetadata::Map(pairs)) => {
            assert_eq!(pairs.len(), 1);
            let (key_meta, member_meta) = &pairs[0];
            assert_eq!(
                key_meta.as_ref().unwrap().ontkey,
                "meta.person.scarlett_johansson"
            );
            assert_eq!(
                member_meta.as_ref().unwrap().ontkey,
                "meta.character.marvel.black_widow"
            );
        }
        other => panic!("expected dict metadata, got {:?}", other),
    }
}
