//! Partitioned, bounded, multi-producer channel set.
//!
//! A [`ChannelSet`] owns a fixed number of fixed-capacity buffers. Producers
//! pick a buffer through the configured [`Partitioner`] (or an explicit key),
//! and each buffer is drained in bulk by exactly one consumer thread of a
//! [`ConsumerPool`].
//!
//! The number of buffered-but-undrained items in a buffer never exceeds its
//! capacity. What happens when a buffer is full depends on the
//! [`BufferStrategy`].

pub mod consumer;
pub mod partition;

pub use consumer::{BatchHandler, BatchItem, ConsumerPool, PoolConfig, PoolSnapshot, PoolStats};
pub use partition::{key_index, Partitioner};

use crate::core::{KestrelError, Result};
use crossbeam::utils::{Backoff, CachePadded};
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Slice used by parked producers to re-check the closed flag.
const PARK_SLICE: Duration = Duration::from_millis(10);

/// Behaviour of `produce` when the selected buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStrategy {
    /// Park the producer until a slot frees. Fails only after close.
    Blocking,
    /// Reject immediately.
    Drop,
    /// Park for at most the given duration, then reject.
    Timeout(Duration),
}

/// Wake-up signal shared by producers and one consumer thread.
#[derive(Debug, Default)]
pub struct Wakeup {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes the waiting consumer, or makes its next wait return immediately.
    pub fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_one();
    }

    /// Waits until notified or `timeout` elapses. Returns true when notified.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        std::mem::replace(&mut *pending, false)
    }
}

struct Buffer<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

/// Point-in-time counters of a channel set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelStats {
    /// Items accepted since start
    pub produced: u64,
    /// Items rejected because a buffer was full
    pub dropped: u64,
    /// Items currently buffered across all buffers
    pub buffered: usize,
    /// Number of buffers
    pub buffers: usize,
    /// Capacity of each buffer
    pub capacity: usize,
}

/// Fixed set of bounded buffers shared by many producers and one consumer pool.
pub struct ChannelSet<T> {
    buffers: Vec<Buffer<T>>,
    capacity: usize,
    strategy: BufferStrategy,
    partitioner: Partitioner,
    batch_threshold: usize,
    cursor: CachePadded<AtomicUsize>,
    closed: AtomicBool,
    /// Producers between the closed check and the end of their insert.
    in_flight: CachePadded<AtomicUsize>,
    wakeups: OnceLock<Vec<Arc<Wakeup>>>,
    produced: AtomicU64,
    dropped: AtomicU64,
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        InFlight(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Release);
    }
}

impl<T> ChannelSet<T> {
    /// Creates `count` buffers of `capacity` items each.
    pub fn new(
        count: usize,
        capacity: usize,
        strategy: BufferStrategy,
        partitioner: Partitioner,
    ) -> Result<Self> {
        if count == 0 || capacity == 0 {
            return Err(KestrelError::config(format!(
                "channel set needs at least one buffer of non-zero capacity (got {}x{})",
                count, capacity
            )));
        }

        let buffers = (0..count)
            .map(|_| {
                let (tx, rx) = crossbeam_channel::bounded(capacity);
                Buffer { tx, rx }
            })
            .collect();

        Ok(ChannelSet {
            buffers,
            capacity,
            strategy,
            partitioner,
            batch_threshold: capacity,
            cursor: CachePadded::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            in_flight: CachePadded::new(AtomicUsize::new(0)),
            wakeups: OnceLock::new(),
            produced: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Buffer length at which producers wake the owning consumer early.
    pub fn with_batch_threshold(mut self, threshold: usize) -> Self {
        self.batch_threshold = threshold.clamp(1, self.capacity);
        self
    }

    /// Inserts `item` into the buffer chosen by the partitioner.
    pub fn produce(&self, item: T) -> bool {
        let index = self.partitioner.select(&self.cursor, self.buffers.len());
        self.produce_to(index, item)
    }

    /// Inserts `item` into the buffer owned by `key`. Equal keys always land
    /// in the same buffer.
    pub fn produce_keyed<K: Hash + ?Sized>(&self, key: &K, item: T) -> bool {
        self.produce_to(key_index(key, self.buffers.len()), item)
    }

    fn produce_to(&self, index: usize, item: T) -> bool {
        let _in_flight = InFlight::enter(&self.in_flight);
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }

        let buffer = &self.buffers[index];
        let accepted = match self.strategy {
            BufferStrategy::Drop => match buffer.tx.try_send(item) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    self.record_drop(index);
                    false
                },
                Err(TrySendError::Disconnected(_)) => false,
            },
            BufferStrategy::Blocking => self.park_send(buffer, item, None),
            BufferStrategy::Timeout(limit) => {
                let accepted = self.park_send(buffer, item, Some(Instant::now() + limit));
                if !accepted && !self.is_closed() {
                    self.record_drop(index);
                }
                accepted
            },
        };

        if accepted {
            self.produced.fetch_add(1, Ordering::Relaxed);
            if buffer.rx.len() >= self.batch_threshold {
                self.wake(index);
            }
        }
        accepted
    }

    fn park_send(&self, buffer: &Buffer<T>, mut item: T, deadline: Option<Instant>) -> bool {
        loop {
            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    remaining.min(PARK_SLICE)
                },
                None => PARK_SLICE,
            };

            match buffer.tx.send_timeout(item, slice) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.is_closed() {
                        return false;
                    }
                    item = back;
                },
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    fn record_drop(&self, index: usize) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped % 10_000 == 1 {
            warn!(buffer = index, dropped, "Channel buffer full, dropping items");
        } else {
            debug!(buffer = index, "Channel buffer full, item dropped");
        }
    }

    fn wake(&self, index: usize) {
        if let Some(wakeups) = self.wakeups.get() {
            wakeups[index].notify();
        }
    }

    /// Removes up to `max_items` from buffer `index`, oldest first.
    pub fn drain(&self, index: usize, max_items: usize) -> Vec<T> {
        self.buffers[index].rx.try_iter().take(max_items).collect()
    }

    /// Items currently held by buffer `index`.
    pub fn buffer_len(&self, index: usize) -> usize {
        self.buffers[index].rx.len()
    }

    /// Items currently held across all buffers.
    pub fn len(&self) -> usize {
        self.buffers.iter().map(|b| b.rx.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.iter().all(|b| b.rx.is_empty())
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Binds one wake-up signal per buffer. A channel set feeds a single pool.
    pub(crate) fn attach_wakeups(&self, wakeups: Vec<Arc<Wakeup>>) -> Result<()> {
        if wakeups.len() != self.buffers.len() {
            return Err(KestrelError::config("one wake-up signal per buffer is required"));
        }
        self.wakeups
            .set(wakeups)
            .map_err(|_| KestrelError::config("channel set is already consumed by a pool"))
    }

    /// Stops accepting items. Parked producers wake up and return false.
    ///
    /// Returns once no producer is mid-insert, so every item for which
    /// `produce` returned true is visible to `drain` afterwards.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(buffers = self.buffers.len(), "Channel set closed");
            if let Some(wakeups) = self.wakeups.get() {
                wakeups.iter().for_each(|w| w.notify());
            }
        }

        let backoff = Backoff::new();
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            backoff.snooze();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            produced: self.produced.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            buffered: self.len(),
            buffers: self.buffers.len(),
            capacity: self.capacity,
        }
    }
}
