//! Instance selection policies.

use crate::channel::key_index;
use crate::core::Message;
use crossbeam::utils::CachePadded;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Chooses one instance index in `0..instances` for a message.
///
/// `instances` is always at least 1.
pub trait Selector: Send + Sync + Debug {
    fn select(&self, instances: usize, message: &Message) -> usize;
}

/// Round robin across instances, for stateless workers.
#[derive(Debug, Default)]
pub struct RollingSelector {
    cursor: CachePadded<AtomicUsize>,
}

impl RollingSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Selector for RollingSelector {
    fn select(&self, instances: usize, _message: &Message) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % instances
    }
}

/// Stable hash of the message routing key, for workers holding per-key state.
///
/// The hash is seedless, so every process in a cluster agrees on the owner of a key.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashCodeSelector;

impl Selector for HashCodeSelector {
    fn select(&self, instances: usize, message: &Message) -> usize {
        key_index(message.routing_key().as_ref(), instances)
    }
}

/// Always the first instance, for singletons.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForeverFirstSelector;

impl Selector for ForeverFirstSelector {
    fn select(&self, _instances: usize, _message: &Message) -> usize {
        0
    }
}
