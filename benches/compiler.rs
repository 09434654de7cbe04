use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use typesense_index_engine::ast::{FieldRef, PredicateNode};
use typesense_index_engine::compiler::compile;

fn flat_conjunction(n: usize) -> Vec<PredicateNode> {
    (0..n)
        .map(|i| PredicateNode::eq_(FieldRef::new(format!("field_{i}")), i as i64))
        .collect()
}

fn nested_or_group(n: usize) -> Vec<PredicateNode> {
    let branches: Vec<PredicateNode> = (0..n)
        .map(|i| PredicateNode::eq_(FieldRef::new("category_id"), i as i64))
        .collect();
    vec![PredicateNode::Group(Box::new(PredicateNode::Or(branches)))]
}

fn joined_membership(n: usize) -> Vec<PredicateNode> {
    (0..n)
        .map(|i| {
            PredicateNode::in_(
                FieldRef::joined("authors", "id"),
                vec![(i as i64).into(), (i as i64 + 1).into()],
            )
            .unwrap()
        })
        .collect()
}

fn bench_compile(c: &mut Criterion) {
    let sizes = [8usize, 64, 512];
    let mut group = c.benchmark_group("compile_filter");

    for &n in &sizes {
        group.throughput(Throughput::Elements(n as u64));

        let flat = flat_conjunction(n);
        group.bench_with_input(BenchmarkId::new("flat_and", n), &flat, |b, nodes| {
            b.iter(|| criterion::black_box(compile(nodes).unwrap()));
        });

        let nested = nested_or_group(n);
        group.bench_with_input(BenchmarkId::new("nested_or_group", n), &nested, |b, nodes| {
            b.iter(|| criterion::black_box(compile(nodes).unwrap()));
        });

        let joined = joined_membership(n);
        group.bench_with_input(BenchmarkId::new("joined_in", n), &joined, |b, nodes| {
            b.iter(|| criterion::black_box(compile(nodes).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compile);
criterion_main!(benches);
