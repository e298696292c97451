use tagbase::criterion::parse_criteria;
use tagbase::entity::{EntityTable, TaggedEntity};
use tagbase::sqltags::SqlTags;
use tagbase::tag::TagValue;
use tagbase::tagset::TagSet;

fn ts(line: &str) -> TagSet {
    TagSet::from_line(line, None).expect("tag line should parse")
}

const SEED_ENTITIES: [(Option<&str>, f64, &str); 4] = [
    (
        Some("one"),
        1600000000.0,
        "colour=blue size=5 title=\"Big Deal\" when=2024-01-02 cast=[\"Alice\",\"Bob\"]",
    ),
    (Some("two"), 1600000001.0, "colour=red size=10 nicks=[\"Zed\"]"),
    (None, 1600000002.5, "colour=blue size=7.5"),
    (Some("four"), 1600000003.0, "colour=blue"),
];

fn setup() -> (SqlTags, EntityTable) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();
    let store = SqlTags::in_memory().unwrap();
    let mut table = EntityTable::new();
    for (name, unixtime, line) in SEED_ENTITIES {
        let tags = ts(line);
        let id = store.add(name, unixtime).unwrap();
        for tag in tags.as_tags() {
            store.add_tag(id, &tag).unwrap();
        }
        let table_id = table.add(name, unixtime, tags).unwrap();
        assert_eq!(id, table_id, "both stores assign ids in insertion order");
    }
    (store, table)
}

#[test]
fn sql_find_agrees_with_in_memory_evaluation() {
    let (store, table) = setup();
    let cases: &[&[&str]] = &[
        &["colour=blue"],
        &["colour"],
        &["colour=blue", "size>5"],
        &["-colour=blue"],
        &["size>=5", "size<10"],
        &["size>4.5"],
        &["cast~\"A*\""],
        &["title~\"Big*\""],
        &["title~/\"^Big\""],
        &["title~/\"Deal\""],
        &["-size"],
        &["size>\"big\""],
        &["-colour=blue", "size>5"],
        &["when=2024-01-02"],
        &["colour=blue", "-cast"],
        &["shape"],
        &["-shape"],
        &["id:1,3"],
        &["id:1,3", "colour=blue"],
        &["-id:2"],
    ];
    for specs in cases {
        let criteria = parse_criteria(specs.iter().copied()).unwrap();
        let sql_ids: Vec<i64> = store
            .find(&criteria)
            .unwrap()
            .iter()
            .map(|e| e.id.unwrap())
            .collect();
        let memory_ids: Vec<i64> =
            table.find(&criteria).iter().map(|e| e.id.unwrap()).collect();
        assert_eq!(
            sql_ids, memory_ids,
            "criteria {:?} disagree between SQL and in-memory evaluation",
            specs
        );
    }
}

#[test]
fn single_row_bridge() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
    let tags = ts("a=1 b=two c=[\"x\",\"y\"] d=\"Mixed Case\"");
    let store = SqlTags::in_memory().unwrap();
    let id = store.add(None, 0.0).unwrap();
    for tag in tags.as_tags() {
        store.add_tag(id, &tag).unwrap();
    }
    let entity = TaggedEntity::new(Some(id), None, 0.0, tags);
    let specs = [
        "a=1", "a=2", "a<2", "a>1", "a>=1", "a<=0", "-a", "-a=1", "-a=9", "b=two",
        "b~\"t*\"", "b~\"T*\"", "b~/\"wo\"", "c~\"x\"", "c~\"z\"", "-c~\"x\"",
        "d~/\"^Mixed\"", "d~/\"case\"", "e", "-e", "e=1", "-e=1",
    ];
    for spec in specs {
        let criteria = parse_criteria([spec]).unwrap();
        let in_memory = criteria[0].match_entity(&entity);
        let via_sql = !store.find(&criteria).unwrap().is_empty();
        assert_eq!(in_memory, via_sql, "criterion {:?} disagrees", spec);
    }
}

#[test]
fn store_assigns_ids_and_fetches_by_name() {
    let (store, _) = setup();
    let one = store.get_by_name("one").unwrap().expect("named entity");
    assert_eq!(one.id, Some(1));
    assert_eq!(one.unixtime, 1600000000.0);
    assert_eq!(one.tags.get("colour"), Some(&TagValue::Str("blue".to_string())));
    // numbers come back from the float column
    assert_eq!(one.tags.get("size"), Some(&TagValue::Float(5.0)));
    assert!(store.get(999).unwrap().is_none());
    assert!(store.get_by_name("nonesuch").unwrap().is_none());
    assert_eq!(store.len().unwrap(), 4);
}

#[test]
fn store_enforces_name_uniqueness() {
    let (store, _) = setup();
    assert!(store.add(Some("one"), 0.0).is_err());
    assert_eq!(store.make("one").unwrap(), 1);
    let id = store.make("five").unwrap();
    assert_eq!(store.get(id).unwrap().unwrap().name.as_deref(), Some("five"));
}

#[test]
fn tag_writes_go_through_immediately() {
    let (store, _) = setup();
    let tag = "colour=green".parse::<tagbase::tag::Tag>().unwrap();
    store.add_tag(1, &tag).unwrap();
    assert_eq!(
        store.tags(1).unwrap().get("colour"),
        Some(&TagValue::Str("green".to_string()))
    );
    // a mismatched conditional discard is a no-op
    assert!(
        store
            .discard_tag(1, "colour", Some(&TagValue::Str("blue".to_string())))
            .unwrap()
            .is_none()
    );
    assert!(store.tags(1).unwrap().contains_name("colour"));
    // a matching conditional discard removes
    let removed = store
        .discard_tag(1, "colour", Some(&TagValue::Str("green".to_string())))
        .unwrap()
        .expect("matching discard removes");
    assert_eq!(removed.to_string(), "colour=green");
    assert!(!store.tags(1).unwrap().contains_name("colour"));
    assert!(store.discard_tag(1, "colour", None).unwrap().is_none());
}

#[test]
fn csv_row_text_form_is_exact() {
    let entity = TaggedEntity::new(Some(1), Some("one".to_string()), 1600000000.0, ts("colour=blue size=5"));
    assert_eq!(entity.csvrow(), "1600000000.0,1,one,colour=blue,size=5");
    let back = TaggedEntity::from_csvrow(&entity.csvrow()).unwrap();
    assert_eq!(back, entity);
    // log entries have no id or name
    let log = TaggedEntity::new(None, None, 1600000000.5, ts("note=ok"));
    assert_eq!(log.csvrow(), "1600000000.5,,,note=ok");
    assert_eq!(TaggedEntity::from_csvrow(&log.csvrow()).unwrap(), log);
}

#[test]
fn csv_rows_quote_embedded_commas_and_quotes() {
    let entity = TaggedEntity::new(
        Some(2),
        None,
        1600000001.0,
        ts("title=\"Big Deal\" cast=[\"Alice\",\"Bob\"]"),
    );
    let row = entity.csvrow();
    assert_eq!(
        row,
        "1600000001.0,2,,\"cast=[\"\"Alice\"\",\"\"Bob\"\"]\",\"title=\"\"Big Deal\"\"\""
    );
    let back = TaggedEntity::from_csvrow(&row).unwrap();
    assert_eq!(back.tags.as_map(), entity.tags.as_map());
}

#[test]
fn csv_export_import_round_trips() {
    let (store, _) = setup();
    let mut out = Vec::new();
    store.export_csv(&mut out, &[]).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert_eq!(text.lines().count(), 4);

    let fresh = SqlTags::in_memory().unwrap();
    let imported = fresh.import_csv(text.as_bytes()).unwrap();
    assert_eq!(imported, 4);
    let criteria = parse_criteria(["colour=blue", "size>5"]).unwrap();
    let original: Vec<Option<String>> =
        store.find(&criteria).unwrap().into_iter().map(|e| e.name).collect();
    let reimported: Vec<Option<String>> =
        fresh.find(&criteria).unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(original, reimported);
}
