//! Consumer pool draining a [`ChannelSet`] in bulk.

use super::{ChannelSet, Wakeup};
use crate::core::{KestrelError, Message, Result};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Items that can carry the end-of-batch marker.
pub trait BatchItem: Send + 'static {
    fn mark_end_of_batch(self) -> Self;
}

impl BatchItem for Message {
    fn mark_end_of_batch(self) -> Self {
        Message::mark_end_of_batch(self)
    }
}

/// Callback invoked by consumer threads.
pub trait BatchHandler<T>: Send + Sync + 'static {
    /// Processes one drained batch. The last item carries the end-of-batch marker.
    fn handle(&self, batch: Vec<T>) -> Result<()>;

    /// Called when a drain cycle found every assigned buffer empty.
    fn on_idle(&self) {}
}

/// Consumer pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Thread name prefix
    pub name: String,
    pub threads: usize,
    pub consume_interval: Duration,
    pub max_batch: usize,
    pub idle_backoff_max: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            name: "consumer".to_string(),
            threads: 1,
            consume_interval: Duration::from_millis(20),
            max_batch: 5_000,
            idle_backoff_max: Duration::from_millis(500),
        }
    }
}

/// Counters shared by all threads of one pool.
#[derive(Debug, Default)]
pub struct PoolStats {
    batches: AtomicU64,
    consumed: AtomicU64,
    handler_errors: AtomicU64,
    idle_cycles: AtomicU64,
}

/// Serializable view of [`PoolStats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolSnapshot {
    pub batches: u64,
    pub consumed: u64,
    pub handler_errors: u64,
    pub idle_cycles: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            idle_cycles: self.idle_cycles.load(Ordering::Relaxed),
        }
    }
}

/// Fixed set of threads, each owning the buffers `p` with `p % threads == id`.
pub struct ConsumerPool<T> {
    channels: Arc<ChannelSet<T>>,
    wakeups: Vec<Arc<Wakeup>>,
    stop: Arc<AtomicBool>,
    stats: Arc<PoolStats>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    name: String,
}

impl<T: BatchItem> ConsumerPool<T> {
    /// Spawns the consumer threads and binds them to `channels`.
    pub fn start(
        channels: Arc<ChannelSet<T>>,
        handler: Arc<dyn BatchHandler<T>>,
        config: PoolConfig,
    ) -> Result<Self> {
        if config.threads == 0 || config.max_batch == 0 {
            return Err(KestrelError::config(format!(
                "consumer pool {} needs at least one thread and a non-zero batch size",
                config.name
            )));
        }

        // Threads without a buffer would only spin.
        let threads = config.threads.min(channels.buffer_count());
        let wakeups: Vec<Arc<Wakeup>> = (0..threads).map(|_| Arc::new(Wakeup::new())).collect();
        let per_buffer = (0..channels.buffer_count())
            .map(|p| Arc::clone(&wakeups[p % threads]))
            .collect();
        channels.attach_wakeups(per_buffer)?;

        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(PoolStats::default());
        let mut handles = Vec::with_capacity(threads);

        for id in 0..threads {
            let worker = ConsumerThread {
                id,
                buffers: (id..channels.buffer_count()).step_by(threads).collect(),
                channels: Arc::clone(&channels),
                handler: Arc::clone(&handler),
                wakeup: Arc::clone(&wakeups[id]),
                stop: Arc::clone(&stop),
                stats: Arc::clone(&stats),
                consume_interval: config.consume_interval,
                max_batch: config.max_batch,
                idle_backoff_max: config.idle_backoff_max.max(config.consume_interval),
            };
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.name, id))
                .spawn(move || worker.run())?;
            handles.push(handle);
        }

        info!(
            pool = %config.name,
            threads,
            buffers = channels.buffer_count(),
            "Consumer pool started"
        );

        Ok(ConsumerPool {
            channels,
            wakeups,
            stop,
            stats,
            handles: parking_lot::Mutex::new(handles),
            name: config.name,
        })
    }

    pub fn channels(&self) -> &Arc<ChannelSet<T>> {
        &self.channels
    }

    pub fn stats(&self) -> PoolSnapshot {
        self.stats.snapshot()
    }

    /// Wakes every thread for an immediate drain cycle.
    pub fn wake_all(&self) {
        self.wakeups.iter().for_each(|w| w.notify());
    }

    /// Closes the buffers, lets every thread drain once more, and joins them.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.channels.close();
        self.stop.store(true, Ordering::Release);
        self.wake_all();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if handle.join().is_err() {
                error!(pool = %self.name, "Consumer thread terminated abnormally");
            }
        }
        info!(pool = %self.name, consumed = self.stats.consumed.load(Ordering::Relaxed), "Consumer pool stopped");
    }
}

impl<T> Drop for ConsumerPool<T> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.channels.close();
        self.wakeups.iter().for_each(|w| w.notify());
    }
}

struct ConsumerThread<T> {
    id: usize,
    buffers: Vec<usize>,
    channels: Arc<ChannelSet<T>>,
    handler: Arc<dyn BatchHandler<T>>,
    wakeup: Arc<Wakeup>,
    stop: Arc<AtomicBool>,
    stats: Arc<PoolStats>,
    consume_interval: Duration,
    max_batch: usize,
    idle_backoff_max: Duration,
}

impl<T: BatchItem> ConsumerThread<T> {
    fn run(self) {
        debug!(thread = self.id, buffers = ?self.buffers, "Consumer thread running");
        let mut wait = self.consume_interval;

        loop {
            let stopping = self.stop.load(Ordering::Acquire);
            let consumed = self.drain_cycle();

            if stopping {
                // Final drain: everything accepted before close is handed over.
                while self.drain_cycle() > 0 {}
                break;
            }

            if consumed > 0 {
                wait = self.consume_interval;
            } else {
                self.stats.idle_cycles.fetch_add(1, Ordering::Relaxed);
                self.handler.on_idle();
                wait = (wait * 2).min(self.idle_backoff_max);
            }

            if self.wakeup.wait(wait) {
                wait = self.consume_interval;
            }
        }

        debug!(thread = self.id, "Consumer thread exiting");
    }

    /// Drains every assigned buffer once and returns the number of items handled.
    fn drain_cycle(&self) -> usize {
        let mut consumed = 0;
        for &buffer in &self.buffers {
            let mut batch = self.channels.drain(buffer, self.max_batch);
            let Some(last) = batch.pop() else {
                continue;
            };
            batch.push(last.mark_end_of_batch());

            let size = batch.len();
            consumed += size;
            self.dispatch(buffer, batch);
        }
        consumed
    }

    fn dispatch(&self, buffer: usize, batch: Vec<T>) {
        let size = batch.len();
        self.stats.batches.fetch_add(1, Ordering::Relaxed);

        match panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(batch))) {
            Ok(Ok(())) => {
                self.stats.consumed.fetch_add(size as u64, Ordering::Relaxed);
            },
            Ok(Err(e)) => {
                self.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                error!(thread = self.id, buffer, size, error = %e, "Batch handler failed, batch discarded");
            },
            Err(_) => {
                self.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                error!(thread = self.id, buffer, size, "Batch handler panicked, batch discarded");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{BufferStrategy, Partitioner};
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        value: u32,
        last: bool,
    }

    impl BatchItem for Item {
        fn mark_end_of_batch(mut self) -> Self {
            self.last = true;
            self
        }
    }

    fn item(value: u32) -> Item {
        Item { value, last: false }
    }

    #[derive(Default)]
    struct Collect {
        batches: Mutex<Vec<Vec<Item>>>,
        fail_on: Option<u32>,
        panic_on: Option<u32>,
    }

    impl BatchHandler<Item> for Collect {
        fn handle(&self, batch: Vec<Item>) -> Result<()> {
            if batch.iter().any(|i| Some(i.value) == self.panic_on) {
                panic!("boom");
            }
            if batch.iter().any(|i| Some(i.value) == self.fail_on) {
                return Err(KestrelError::handler("rejected"));
            }
            self.batches.lock().push(batch);
            Ok(())
        }
    }

    fn config(threads: usize) -> PoolConfig {
        PoolConfig {
            name: "test".to_string(),
            threads,
            consume_interval: Duration::from_millis(5),
            max_batch: 1_000,
            idle_backoff_max: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_last_item_marks_end_of_batch() {
        let channels =
            Arc::new(ChannelSet::new(1, 100, BufferStrategy::Blocking, Partitioner::RoundRobin).unwrap());
        for i in 0..5 {
            assert!(channels.produce(item(i)));
        }

        let handler = Arc::new(Collect::default());
        let pool = ConsumerPool::start(Arc::clone(&channels), Arc::clone(&handler) as Arc<dyn BatchHandler<Item>>, config(1)).unwrap();
        pool.shutdown();

        let batches = handler.batches.lock();
        let all: Vec<&Item> = batches.iter().flatten().collect();
        assert_eq!(all.len(), 5);
        for batch in batches.iter() {
            let (last, rest) = batch.split_last().unwrap();
            assert!(last.last);
            assert!(rest.iter().all(|i| !i.last));
        }
    }

    #[test]
    fn test_handler_errors_do_not_stop_thread() {
        let channels =
            Arc::new(ChannelSet::new(1, 100, BufferStrategy::Blocking, Partitioner::RoundRobin).unwrap());
        let handler = Arc::new(Collect {
            fail_on: Some(1),
            panic_on: Some(2),
            ..Default::default()
        });
        let pool = ConsumerPool::start(Arc::clone(&channels), Arc::clone(&handler) as Arc<dyn BatchHandler<Item>>, config(1)).unwrap();

        for value in [1, 2, 3] {
            assert!(channels.produce(item(value)));
            pool.wake_all();
            thread::sleep(Duration::from_millis(40));
        }
        pool.shutdown();

        let stats = pool.stats();
        assert_eq!(stats.handler_errors, 2);
        let values: Vec<u32> = handler.batches.lock().iter().flatten().map(|i| i.value).collect();
        assert_eq!(values, vec![3]);
    }

    #[test]
    fn test_shutdown_drains_remaining_items() {
        let channels =
            Arc::new(ChannelSet::new(4, 1_000, BufferStrategy::Blocking, Partitioner::RoundRobin).unwrap());
        let handler = Arc::new(Collect::default());
        let pool = ConsumerPool::start(Arc::clone(&channels), Arc::clone(&handler) as Arc<dyn BatchHandler<Item>>, config(2)).unwrap();

        for i in 0..2_000 {
            assert!(channels.produce(item(i)));
        }
        pool.shutdown();

        assert!(!channels.produce(item(0)));
        let mut values: Vec<u32> = handler.batches.lock().iter().flatten().map(|i| i.value).collect();
        values.sort_unstable();
        assert_eq!(values, (0..2_000).collect::<Vec<_>>());
    }

    #[test]
    fn test_channel_set_feeds_one_pool_only() {
        let channels =
            Arc::new(ChannelSet::new(2, 10, BufferStrategy::Drop, Partitioner::RoundRobin).unwrap());
        let first = ConsumerPool::start(Arc::clone(&channels), Arc::new(Collect::default()), config(1)).unwrap();
        let second = ConsumerPool::start(Arc::clone(&channels), Arc::new(Collect::default()), config(1));
        assert!(second.is_err());
        first.shutdown();
    }
}
