// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use cctprof::expr::{BinaryOp, Expr, UnaryOp};
use cctprof::metric::{EventBinding, MetricUnit, MetricValue};
use cctprof::{CctMetricStore, Evaluator, MetricRegistry};
use criterion::{criterion_group, criterion_main, Criterion};

fn bench_evaluate(c: &mut Criterion) {
    let registry = Arc::new(MetricRegistry::new());
    let binding = EventBinding::new("bench", "BENCH", 1);
    let a = registry
        .register_raw("a", MetricUnit::Events, binding.clone())
        .unwrap();
    let b = registry
        .register_raw("b", MetricUnit::Events, binding)
        .unwrap();
    let diff = registry
        .register_computed(
            "diff",
            MetricUnit::Events,
            Expr::binary(BinaryOp::Sub, Expr::leaf(a), Expr::leaf(b)),
        )
        .unwrap();
    registry
        .register_computed(
            "spread",
            MetricUnit::Events,
            Expr::binary(
                BinaryOp::Div,
                Expr::unary(UnaryOp::Abs, Expr::leaf(diff)),
                Expr::binary(BinaryOp::Max, Expr::leaf(b), Expr::constant(1i64)),
            ),
        )
        .unwrap();

    let store = CctMetricStore::new(registry);

    const SIZE: usize = 1000;

    let nodes: Vec<_> = (0..SIZE)
        .map(|_| {
            let node = store.new_node();
            store
                .increment(&node, a, MetricValue::Int(rand::random::<u16>() as i64))
                .unwrap();
            store
                .increment(&node, b, MetricValue::Int(rand::random::<u16>() as i64))
                .unwrap();
            node
        })
        .collect();

    c.bench_function("evaluate_all", |bench| {
        let evaluator = Evaluator::new(&store);
        bench.iter(|| {
            nodes.iter().for_each(|node| {
                evaluator.evaluate_all(node).unwrap();
            })
        })
    });
}

criterion_group!(benches, bench_evaluate);
criterion_main!(benches);
