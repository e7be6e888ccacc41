//! Buffer selection policies.

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Maps an incoming item to one buffer index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partitioner {
    /// Atomic counter modulo buffer count. Balances load, no producer affinity.
    #[default]
    RoundRobin,
    /// Hash of the calling thread's identity. Preserves per-producer ordering.
    ProducerAffinity,
}

impl Partitioner {
    /// Picks the buffer for the next item produced by the current thread.
    #[inline]
    pub fn select(self, cursor: &AtomicUsize, buffers: usize) -> usize {
        match self {
            Partitioner::RoundRobin => cursor.fetch_add(1, Ordering::Relaxed) % buffers,
            Partitioner::ProducerAffinity => key_index(&std::thread::current().id(), buffers),
        }
    }
}

/// Stable index for an explicit partition key.
#[inline]
pub fn key_index<K: Hash + ?Sized>(key: &K, buffers: usize) -> usize {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() % buffers as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_cycles() {
        let cursor = AtomicUsize::new(0);
        let picks: Vec<usize> = (0..6).map(|_| Partitioner::RoundRobin.select(&cursor, 3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_affinity_is_stable_per_thread() {
        let cursor = AtomicUsize::new(0);
        let first = Partitioner::ProducerAffinity.select(&cursor, 7);
        for _ in 0..100 {
            assert_eq!(Partitioner::ProducerAffinity.select(&cursor, 7), first);
        }
        assert_eq!(cursor.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_key_index_in_range() {
        for i in 0..1_000 {
            let key = format!("key-{}", i);
            let index = key_index(key.as_str(), 5);
            assert!(index < 5);
            assert_eq!(index, key_index(key.as_str(), 5));
        }
    }
}
