//! Hot path benchmarks: buffer produce/drain, record merge and instance selection.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kestrel_lib::channel::{BufferStrategy, ChannelSet, Partitioner};
use kestrel_lib::core::{Downsampling, Message, Payload, ServiceName, ServiceReference};
use kestrel_lib::metrics::{ColumnValue, MergeOp, MetricRecord};
use kestrel_lib::worker::{HashCodeSelector, Selector};
use std::time::Duration;

const TS: i64 = 1_704_103_230_000;

fn reference(source: &str, latency: i64) -> Message {
    Message::new(Payload::Reference(ServiceReference {
        source: ServiceName::new(source.to_string()).unwrap(),
        dest: ServiceName::new("db".to_string()).unwrap(),
        timestamp_ms: TS,
        latency_ms: latency,
        is_error: false,
    }))
}

fn relation(latency: i64) -> MetricRecord {
    MetricRecord::new("service_relation", Downsampling::Minute, TS, "svc-A->db")
        .column("entity_id", MergeOp::None, ColumnValue::Text("svc-A->db".to_string()))
        .column("calls", MergeOp::Add, ColumnValue::Long(1))
        .column("latency_sum", MergeOp::Add, ColumnValue::Long(latency))
        .column("latency_max", MergeOp::Max, ColumnValue::Long(latency))
        .column("latency_min", MergeOp::Min, ColumnValue::Long(latency))
}

/// TARGET: <200ns per produce on an uncontended buffer
fn bench_channel_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_set");

    for partitioner in [Partitioner::RoundRobin, Partitioner::ProducerAffinity] {
        let channels = ChannelSet::new(4, 10_000, BufferStrategy::Drop, partitioner).unwrap();
        group.bench_with_input(
            BenchmarkId::new("produce_drain", format!("{:?}", partitioner)),
            &channels,
            |b, channels| {
                b.iter(|| {
                    for i in 0..100u64 {
                        channels.produce(black_box(i));
                    }
                    for index in 0..channels.buffer_count() {
                        black_box(channels.drain(index, 100));
                    }
                });
            },
        );
    }

    let channels = ChannelSet::new(4, 10_000, BufferStrategy::Drop, Partitioner::RoundRobin).unwrap();
    group.bench_function("produce_keyed", |b| {
        b.iter(|| {
            for i in 0..100u64 {
                channels.produce_keyed(black_box("svc-A->db"), i);
            }
            for index in 0..channels.buffer_count() {
                black_box(channels.drain(index, 100));
            }
        });
    });

    group.finish();
}

/// TARGET: <100ns per merge of a five column record
fn bench_record_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_merge");

    let deltas: Vec<MetricRecord> = (0..100).map(relation).collect();
    group.bench_function("fold_100", |b| {
        b.iter(|| {
            let mut acc = deltas[0].clone();
            for delta in &deltas[1..] {
                acc.merge(black_box(delta)).unwrap();
            }
            black_box(acc);
        });
    });

    let minute = relation(42);
    group.bench_function("downsample_hour", |b| {
        b.iter(|| black_box(minute.downsample(Downsampling::Hour)));
    });

    group.finish();
}

fn bench_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("instance_selection");

    let messages: Vec<Message> = (0..64).map(|i| reference(&format!("svc-{}", i), i)).collect();
    for instances in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::new("hash_code", instances), &instances, |b, &instances| {
            b.iter(|| {
                for message in &messages {
                    black_box(HashCodeSelector.select(instances, black_box(message)));
                }
            });
        });
    }

    group.finish();
}

criterion_group! {
    name = hot_paths;
    config = Criterion::default()
        .significance_level(0.01)
        .sample_size(200)
        .measurement_time(Duration::from_secs(5))
        .warm_up_time(Duration::from_secs(2));
    targets = bench_channel_set,
              bench_record_merge,
              bench_selection
}

criterion_main!(hot_paths);
