//! Benchmarks for buffer flow through a graph
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mediaflow_rs::config::{GraphConfig, RuntimeConfig, SchedulerSettings};
use mediaflow_rs::pipeline::tunnel::negotiate_supplier;
use mediaflow_rs::pipeline::{ConfigValue, Graph, Memory, NodeState, SupplierRole};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

fn config(multithreaded: bool) -> RuntimeConfig {
    RuntimeConfig {
        scheduler: SchedulerSettings {
            threads: 2,
            multithreaded,
        },
        ..RuntimeConfig::default()
    }
}

fn run_pass_through(multithreaded: bool, frames: u64) -> i64 {
    let mut description = GraphConfig::pass_through();
    description.nodes[0].frames = Some(frames);
    let (mut graph, _events) = Graph::load(config(multithreaded), &description).unwrap();
    graph.transition_all(NodeState::Idle, TIMEOUT).unwrap();
    graph.transition_all(NodeState::Executing, TIMEOUT).unwrap();

    let sink = graph.node_by_name("sink").unwrap().clone();
    graph.wait_until(TIMEOUT, |_| {
        sink.get_parameter("eos") == Ok(ConfigValue::Bool(true))
    });
    let frames = match sink.get_parameter("frames") {
        Ok(ConfigValue::Int(n)) => n,
        _ => 0,
    };
    graph.shutdown(TIMEOUT).unwrap();
    frames
}

fn bench_pass_through(c: &mut Criterion) {
    let mut group = c.benchmark_group("pass_through");
    group.sample_size(20);

    for frames in [64u64, 512].iter() {
        group.throughput(Throughput::Elements(*frames));
        group.bench_with_input(BenchmarkId::new("manual", frames), frames, |b, &frames| {
            b.iter(|| black_box(run_pass_through(false, frames)));
        });
        group.bench_with_input(BenchmarkId::new("threaded", frames), frames, |b, &frames| {
            b.iter(|| black_box(run_pass_through(true, frames)));
        });
    }

    group.finish();
}

fn bench_payload_copy(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_copy");

    for size in [256usize, 4096, 65_536].iter() {
        let source = Memory::from_vec((0..*size).map(|i| i as u8).collect());
        let target = Memory::allocate(*size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("slot", size), size, |b, _| {
            b.iter(|| {
                source.read(|src| target.write(|dst| dst.copy_from_slice(black_box(src))));
            });
        });
    }

    group.finish();
}

fn bench_negotiation(c: &mut Criterion) {
    let roles = [
        SupplierRole::Unspecified,
        SupplierRole::Input,
        SupplierRole::Output,
    ];
    c.bench_function("negotiate_supplier", |b| {
        b.iter(|| {
            for own in roles {
                for proposed in roles {
                    black_box(negotiate_supplier(black_box(own), black_box(proposed)));
                }
            }
        });
    });
}

criterion_group!(benches, bench_pass_through, bench_payload_copy, bench_negotiation);
criterion_main!(benches);
