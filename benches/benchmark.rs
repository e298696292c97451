use criterion::{Criterion, black_box, criterion_group, criterion_main};

use tagbase::criterion::{IdSet, TagSetCriterion, parse_criteria};
use tagbase::tagset::TagSet;

fn parse_tag_line(c: &mut Criterion) {
    let line = "blue topic=tagging subtopic=ontologies count=3 ratio=0.5 \
                title=\"Big Deal\" when=2024-01-02 cast=[\"Alice\",\"Bob\"] a.b.c=1 flag";
    c.bench_function("parse_tag_line", |b| {
        b.iter(|| TagSet::from_line(black_box(line), None).unwrap())
    });
}

fn match_criteria(c: &mut Criterion) {
    let tags = TagSet::from_line(
        "colour=blue size=5 title=\"Big Deal\" cast=[\"Alice\",\"Bob\"]",
        None,
    )
    .unwrap();
    let criteria: Vec<TagSetCriterion> =
        parse_criteria(["colour=blue", "size>4", "cast~\"A*\"", "-shape"]).unwrap();
    c.bench_function("match_criteria", |b| {
        b.iter(|| {
            criteria
                .iter()
                .all(|criterion| criterion.match_tag_set(black_box(&tags)))
        })
    });
}

fn intersect_id_sets(c: &mut Criterion) {
    let mut evens = IdSet::new();
    let mut thirds = IdSet::new();
    for id in 0..10_000u64 {
        if id % 2 == 0 {
            evens.push(id);
        }
        if id % 3 == 0 {
            thirds.push(id);
        }
    }
    c.bench_function("intersect_id_sets", |b| {
        b.iter(|| {
            let mut result = evens.clone();
            result.intersect_with(black_box(&thirds));
            result.len()
        })
    });
}

criterion_group!(benches, parse_tag_line, match_criteria, intersect_id_sets);
criterion_main!(benches);
