//! Merge semantics and merge-on-flush persistence tests.

mod common;

use common::{total, TS};
use kestrel_lib::core::{AggregationKey, Downsampling};
use kestrel_lib::metrics::{ColumnValue, MergeOp, MetricRecord};
use kestrel_lib::monitoring::IngestStats;
use kestrel_lib::persistence::{MetricsPersistentWorker, PersistenceTimer, WorkerState};
use kestrel_lib::storage::{InMemoryMetricsDao, MetricsDao};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn delta(calls: i64, latency: i64, name: &str) -> MetricRecord {
    MetricRecord::new("service_relation", Downsampling::Minute, TS, "svc-A->svc-B")
        .column("entity_id", MergeOp::None, ColumnValue::Text("svc-A->svc-B".to_string()))
        .column("calls", MergeOp::Add, ColumnValue::Long(calls))
        .column("latency_max", MergeOp::Max, ColumnValue::Long(latency))
        .column("latency_min", MergeOp::Min, ColumnValue::Long(latency))
        .column("cpu", MergeOp::Add, ColumnValue::Double((calls % 1_000) as f64 * 0.5))
        .column("caller", MergeOp::None, ColumnValue::Text(name.to_string()))
}

fn fold(records: &[MetricRecord]) -> MetricRecord {
    let mut iter = records.iter();
    let mut acc = iter.next().cloned().unwrap();
    for record in iter {
        acc.merge(record).unwrap();
    }
    acc
}

fn worker(dao: &Arc<InMemoryMetricsDao>, merge_with_storage: bool) -> Arc<MetricsPersistentWorker> {
    Arc::new(MetricsPersistentWorker::new(
        "metrics_minute-0",
        Downsampling::Minute,
        Arc::clone(dao) as Arc<dyn MetricsDao>,
        merge_with_storage,
        Arc::new(IngestStats::new()),
    ))
}

fn stored_total(dao: &InMemoryMetricsDao, entity: &str) -> Option<i64> {
    let key = AggregationKey::for_time(Downsampling::Minute, TS, entity);
    dao.get("test_total", &key).and_then(|r| r.long("total"))
}

/// Counter deltas, biased towards both ends of the i64 range.
fn calls() -> impl Strategy<Value = i64> {
    prop_oneof![
        -1_000i64..1_000,
        (i64::MAX - 16)..=i64::MAX,
        i64::MIN..=(i64::MIN + 16),
        any::<i64>(),
    ]
}

fn wrapping_total(values: &[(i64, i64)]) -> i64 {
    values.iter().fold(0i64, |acc, (c, _)| acc.wrapping_add(*c))
}

proptest! {
    /// Any order of the same deltas folds to the same record.
    #[test]
    fn prop_merge_is_order_independent(
        (original, shuffled) in prop::collection::vec((calls(), any::<i64>()), 1..20)
            .prop_flat_map(|values| (Just(values.clone()), Just(values).prop_shuffle()))
    ) {
        let as_records = |values: &[(i64, i64)]| -> Vec<MetricRecord> {
            values.iter().map(|(c, l)| delta(*c, *l, "caller-1")).collect()
        };
        let a = fold(&as_records(&original));
        let b = fold(&as_records(&shuffled));

        prop_assert_eq!(a.long("calls"), b.long("calls"));
        prop_assert_eq!(a.long("latency_max"), b.long("latency_max"));
        prop_assert_eq!(a.long("latency_min"), b.long("latency_min"));
        prop_assert_eq!(a.text("caller"), b.text("caller"));
        prop_assert_eq!(a.long("calls"), Some(wrapping_total(&original)));
    }

    /// (a + b) + c == a + (b + c)
    #[test]
    fn prop_merge_is_associative(
        a in (calls(), any::<i64>()),
        b in (calls(), any::<i64>()),
        c in (calls(), any::<i64>()),
    ) {
        let (ra, rb, rc) = (delta(a.0, a.1, "x"), delta(b.0, b.1, "x"), delta(c.0, c.1, "x"));

        let mut left = ra.clone();
        left.merge(&rb).unwrap();
        left.merge(&rc).unwrap();

        let mut right_tail = rb;
        right_tail.merge(&rc).unwrap();
        let mut right = ra;
        right.merge(&right_tail).unwrap();

        prop_assert_eq!(left, right);
    }
}

/// total=3 and total=7 for one key persist as total=10, whatever the order.
#[test]
fn test_two_updates_persist_as_their_sum() {
    for order in [[3, 7], [7, 3]] {
        let dao = Arc::new(InMemoryMetricsDao::new());
        let worker = worker(&dao, true);
        for value in order {
            worker.accept(total("svc-A", value)).unwrap();
        }
        assert_eq!(worker.dirty(), 1);

        let report = worker.flush();
        assert_eq!(report.records, 1);
        assert_eq!(report.written, 1);
        assert_eq!(stored_total(&dao, "svc-A"), Some(10));
        assert_eq!(worker.state(), WorkerState::Idle);
    }
}

/// Updates split across flush cycles still add up in storage.
#[test]
fn test_cycles_accumulate_in_storage() {
    for merge_with_storage in [true, false] {
        let dao = Arc::new(InMemoryMetricsDao::new());
        let worker = worker(&dao, merge_with_storage);

        worker.accept(total("svc-A", 3)).unwrap();
        worker.flush();
        worker.accept(total("svc-A", 7)).unwrap();
        worker.flush();

        assert_eq!(stored_total(&dao, "svc-A"), Some(10), "merge_with_storage={}", merge_with_storage);
        assert_eq!(dao.len(), 1);
    }
}

/// Re-merging an all-zero delta leaves the stored row unchanged.
#[test]
fn test_zero_delta_is_a_no_op() {
    let dao = Arc::new(InMemoryMetricsDao::new());
    let worker = worker(&dao, true);
    worker.accept(total("svc-A", 10)).unwrap();
    worker.flush();
    let before = dao.records("test_total");

    let zero = MetricRecord::new("test_total", Downsampling::Minute, TS, "svc-A")
        .column("entity_id", MergeOp::None, ColumnValue::Text(String::new()))
        .column("total", MergeOp::Add, ColumnValue::Long(0));
    assert!(zero.is_empty_delta());
    worker.accept(zero).unwrap();
    worker.flush();

    assert_eq!(dao.records("test_total"), before);
}

#[test]
fn test_failed_write_loses_only_that_cycle() {
    let dao = Arc::new(InMemoryMetricsDao::new());
    let stats = Arc::new(IngestStats::new());
    let worker = MetricsPersistentWorker::new(
        "metrics_minute-0",
        Downsampling::Minute,
        Arc::clone(&dao) as Arc<dyn MetricsDao>,
        true,
        Arc::clone(&stats),
    );

    worker.accept(total("svc-A", 3)).unwrap();
    worker.flush();

    dao.fail_writes(true);
    worker.accept(total("svc-A", 100)).unwrap();
    let report = worker.flush();
    assert_eq!(report.lost, 1);
    assert_eq!(worker.dirty(), 0);

    dao.fail_writes(false);
    worker.accept(total("svc-A", 7)).unwrap();
    worker.flush();

    assert_eq!(stored_total(&dao, "svc-A"), Some(10));
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.flush_failures, 1);
    assert_eq!(snapshot.records_lost, 1);
}

#[test]
fn test_keys_are_kept_apart() {
    let dao = Arc::new(InMemoryMetricsDao::new());
    let worker = worker(&dao, false);
    for (entity, value) in [("svc-A", 1), ("svc-B", 2), ("svc-A", 4), ("svc-C", 8)] {
        worker.accept(total(entity, value)).unwrap();
    }
    assert_eq!(worker.dirty(), 3);
    worker.flush();

    assert_eq!(stored_total(&dao, "svc-A"), Some(5));
    assert_eq!(stored_total(&dao, "svc-B"), Some(2));
    assert_eq!(stored_total(&dao, "svc-C"), Some(8));
}

#[test]
fn test_timer_flushes_in_background() {
    let dao = Arc::new(InMemoryMetricsDao::new());
    let worker = worker(&dao, true);
    let timer = PersistenceTimer::start(vec![Arc::clone(&worker)], Duration::from_millis(10)).unwrap();

    worker.accept(total("svc-A", 3)).unwrap();
    assert!(common::wait_until(Duration::from_secs(5), || stored_total(&dao, "svc-A") == Some(3)));
    worker.accept(total("svc-A", 7)).unwrap();
    timer.shutdown();

    assert_eq!(stored_total(&dao, "svc-A"), Some(10));
}
