//! Benchmarks for publish propagation
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use cascade_core::{Connection, Engine, Inputs, NodeRef, Registry, TransformResult, Value};

fn increment(inputs: &Inputs<'_>) -> TransformResult {
    Ok(Some(Value::new(inputs.require::<u64>(0)? + 1)))
}

fn sum(inputs: &Inputs<'_>) -> TransformResult {
    let mut total = 0u64;
    for index in 0..inputs.len() {
        total += inputs.get::<u64>(index)?.copied().unwrap_or(0);
    }
    Ok(Some(Value::new(total)))
}

/// `source -> n1 -> n2 -> ... -> n{len}`
fn chain(len: usize) -> (Engine, NodeRef<u64>) {
    let registry = Registry::new();
    let source = registry.stream::<u64>();
    let engine = Engine::new(&registry);
    let mut previous = source;
    for _ in 0..len {
        let next = registry.stream::<u64>();
        engine
            .connect(Connection::new([previous.id()], next.id(), increment))
            .unwrap();
        previous = next;
    }
    engine.subscribe(previous, |value, _| {
        black_box(*value);
    })
    .unwrap();
    (engine, source)
}

/// `source` fans out to `width` nodes that all converge on one sink.
fn diamond(width: usize) -> (Engine, NodeRef<u64>) {
    let registry = Registry::new();
    let source = registry.stream::<u64>();
    let sink = registry.stream::<u64>();
    let engine = Engine::new(&registry);
    let mut arms = Vec::with_capacity(width);
    for _ in 0..width {
        let arm = registry.stream::<u64>();
        engine
            .connect(Connection::new([source.id()], arm.id(), increment))
            .unwrap();
        arms.push(arm.id());
    }
    engine.connect(Connection::new(arms, sink.id(), sum)).unwrap();
    engine.subscribe(sink, |value, _| {
        black_box(*value);
    })
    .unwrap();
    (engine, source)
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain");

    for len in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*len as u64));
        group.bench_with_input(BenchmarkId::new("publish", len), len, |b, &len| {
            let (engine, source) = chain(len);
            let mut i = 0u64;
            b.iter(|| {
                engine.publish(source, black_box(i)).unwrap();
                i = i.wrapping_add(1);
            });
        });
    }

    group.finish();
}

fn bench_diamond(c: &mut Criterion) {
    let mut group = c.benchmark_group("diamond");

    for width in [4, 32, 256].iter() {
        group.throughput(Throughput::Elements(*width as u64));
        group.bench_with_input(BenchmarkId::new("publish", width), width, |b, &width| {
            let (engine, source) = diamond(width);
            let mut i = 0u64;
            b.iter(|| {
                engine.publish(source, black_box(i)).unwrap();
                i = i.wrapping_add(1);
            });
        });
    }

    group.finish();
}

/// Building a plan from scratch, as happens after every `connect`.
fn bench_first_publish(c: &mut Criterion) {
    c.bench_function("first_publish/chain_100", |b| {
        b.iter_with_setup(|| chain(100), |(engine, source)| {
            engine.publish(source, 1).unwrap();
        });
    });
}

criterion_group!(benches, bench_chain, bench_diamond, bench_first_publish);
criterion_main!(benches);
