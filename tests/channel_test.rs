//! Bounded channel set and consumer pool tests.

use kestrel_lib::channel::{
    BatchHandler, BatchItem, BufferStrategy, ChannelSet, ConsumerPool, Partitioner, PoolConfig,
};
use kestrel_lib::core::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Item {
    producer: usize,
    seq: usize,
    last: bool,
}

impl BatchItem for Item {
    fn mark_end_of_batch(mut self) -> Self {
        self.last = true;
        self
    }
}

fn item(producer: usize, seq: usize) -> Item {
    Item {
        producer,
        seq,
        last: false,
    }
}

#[derive(Default)]
struct Gather {
    items: Mutex<Vec<Item>>,
    batches: AtomicUsize,
}

impl BatchHandler<Item> for Gather {
    fn handle(&self, batch: Vec<Item>) -> Result<()> {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.items.lock().extend(batch);
        Ok(())
    }
}

fn pool_config(threads: usize) -> PoolConfig {
    PoolConfig {
        name: "test".to_string(),
        threads,
        consume_interval: Duration::from_millis(2),
        max_batch: 64,
        idle_backoff_max: Duration::from_millis(10),
    }
}

/// Two buffers of 100, drop strategy, 4 producers of 50 items each.
#[test]
fn test_drop_strategy_fills_exactly_to_capacity() {
    let channels = Arc::new(ChannelSet::new(2, 100, BufferStrategy::Drop, Partitioner::RoundRobin).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|p| {
            let channels = Arc::clone(&channels);
            thread::spawn(move || (0..50).filter(|s| channels.produce(item(p, *s))).count())
        })
        .collect();
    let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(accepted, 200);
    assert_eq!(channels.buffer_len(0), 100);
    assert_eq!(channels.buffer_len(1), 100);

    // the 201st insert fails, and keeps failing until a drain frees a slot
    assert!(!channels.produce(item(9, 0)));
    assert!(!channels.produce(item(9, 1)));
    assert_eq!(channels.stats().dropped, 2);

    assert_eq!(channels.drain(0, 1).len(), 1);
    assert_eq!(channels.drain(1, 1).len(), 1);
    assert!(channels.produce(item(9, 2)));
    assert_eq!(channels.len(), 200);
}

/// Buffered items never exceed count x capacity, whatever producers do.
#[test]
fn test_capacity_bound_under_contention() {
    let channels = Arc::new(ChannelSet::new(3, 16, BufferStrategy::Drop, Partitioner::ProducerAffinity).unwrap());
    let stop = Arc::new(AtomicBool::new(false));

    let producers: Vec<_> = (0..6)
        .map(|p| {
            let channels = Arc::clone(&channels);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut seq = 0;
                while !stop.load(Ordering::Relaxed) {
                    channels.produce(item(p, seq));
                    seq += 1;
                }
            })
        })
        .collect();

    for round in 0..200 {
        assert!(channels.len() <= 3 * 16);
        for index in 0..3 {
            assert!(channels.buffer_len(index) <= 16);
        }
        channels.drain(round % 3, 5);
    }

    stop.store(true, Ordering::Relaxed);
    for producer in producers {
        producer.join().unwrap();
    }
    assert!(channels.len() <= 48);
}

/// Blocking producers never lose an item while a pool drains concurrently.
#[test]
fn test_blocking_strategy_loses_nothing() {
    let channels = Arc::new(ChannelSet::new(4, 8, BufferStrategy::Blocking, Partitioner::RoundRobin).unwrap());
    let handler = Arc::new(Gather::default());
    let pool = ConsumerPool::start(Arc::clone(&channels), Arc::clone(&handler) as Arc<dyn BatchHandler<Item>>, pool_config(2)).unwrap();

    let producers: Vec<_> = (0..8)
        .map(|p| {
            let channels = Arc::clone(&channels);
            thread::spawn(move || {
                for seq in 0..500 {
                    assert!(channels.produce(item(p, seq)));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    pool.shutdown();

    let items = handler.items.lock();
    assert_eq!(items.len(), 8 * 500);
    let unique: HashSet<(usize, usize)> = items.iter().map(|i| (i.producer, i.seq)).collect();
    assert_eq!(unique.len(), 8 * 500);
    assert_eq!(pool.stats().consumed, 8 * 500);
}

/// One producer with keyed inserts keeps its order within a buffer.
#[test]
fn test_keyed_items_keep_fifo_order() {
    let channels = Arc::new(ChannelSet::new(4, 1_000, BufferStrategy::Blocking, Partitioner::RoundRobin).unwrap());
    for seq in 0..300 {
        assert!(channels.produce_keyed("svc-A->svc-B", item(0, seq)));
    }

    let handler = Arc::new(Gather::default());
    let pool = ConsumerPool::start(Arc::clone(&channels), Arc::clone(&handler) as Arc<dyn BatchHandler<Item>>, pool_config(1)).unwrap();
    pool.shutdown();

    let seqs: Vec<usize> = handler.items.lock().iter().map(|i| i.seq).collect();
    assert_eq!(seqs, (0..300).collect::<Vec<_>>());
}

/// Producers racing a shutdown: every accepted item reaches the handler.
#[test]
fn test_items_accepted_during_shutdown_are_consumed() {
    for strategy in [BufferStrategy::Drop, BufferStrategy::Blocking] {
        for _ in 0..10 {
            let channels = Arc::new(ChannelSet::new(2, 100_000, strategy, Partitioner::RoundRobin).unwrap());
            let handler = Arc::new(Gather::default());
            let config = PoolConfig {
                max_batch: 10_000,
                ..pool_config(2)
            };
            let pool = ConsumerPool::start(Arc::clone(&channels), Arc::clone(&handler) as Arc<dyn BatchHandler<Item>>, config).unwrap();

            let producers: Vec<_> = (0..8)
                .map(|p| {
                    let channels = Arc::clone(&channels);
                    thread::spawn(move || {
                        let mut accepted = 0;
                        let mut seq = 0;
                        while !channels.is_closed() {
                            if channels.produce(item(p, seq)) {
                                accepted += 1;
                            }
                            seq += 1;
                        }
                        accepted
                    })
                })
                .collect();

            thread::sleep(Duration::from_millis(5));
            pool.shutdown();
            let accepted: usize = producers.into_iter().map(|h| h.join().unwrap()).sum();

            assert_eq!(handler.items.lock().len(), accepted, "{:?}", strategy);
            assert_eq!(pool.stats().consumed, accepted as u64);
            assert!(channels.is_empty());
        }
    }
}

#[test]
fn test_produce_after_shutdown_fails() {
    let channels = Arc::new(ChannelSet::new(2, 10, BufferStrategy::Blocking, Partitioner::RoundRobin).unwrap());
    let pool = ConsumerPool::start(Arc::clone(&channels), Arc::new(Gather::default()), pool_config(2)).unwrap();
    pool.shutdown();
    pool.shutdown();

    assert!(channels.is_closed());
    assert!(!channels.produce(item(0, 0)));
}
