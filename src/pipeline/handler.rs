//! Ingest batch handler: typed analysis plus L1 pre-aggregation.

use crate::analysis::Analyzer;
use crate::channel::BatchHandler;
use crate::core::{AggregationKey, Message, Payload, PayloadKind, Result};
use crate::metrics::MetricRecord;
use crate::monitoring::IngestStats;
use crate::worker::{Delivery, Role};
use dashmap::DashSet;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, error, warn};

type L1Map = HashMap<(String, AggregationKey), MetricRecord>;

/// Consumes drained ingest batches.
///
/// Each batch is grouped by [`PayloadKind`] and handed to the matching
/// analyzer. The resulting minute records are merged into a map owned by the
/// consumer thread and sent to the target role when the end-of-batch item
/// arrives, so one drain cycle produces at most one message per key.
pub struct IngestHandler {
    analyzers: HashMap<PayloadKind, Box<dyn Analyzer>>,
    target: Arc<Role>,
    stats: Arc<IngestStats>,
    warned: DashSet<PayloadKind>,
    l1: Mutex<HashMap<ThreadId, L1Map>>,
}

impl IngestHandler {
    pub fn new(analyzers: Vec<Box<dyn Analyzer>>, target: Arc<Role>, stats: Arc<IngestStats>) -> Self {
        let analyzers = analyzers
            .into_iter()
            .map(|analyzer| (analyzer.kind(), analyzer))
            .collect();
        IngestHandler {
            analyzers,
            target,
            stats,
            warned: DashSet::new(),
            l1: Mutex::new(HashMap::new()),
        }
    }

    pub fn target(&self) -> &Arc<Role> {
        &self.target
    }

    /// Records held back because their batch had no end-of-batch marker.
    pub fn pending(&self) -> usize {
        self.l1.lock().values().map(HashMap::len).sum()
    }

    /// Dispatches every thread's held-back records.
    pub fn flush_pending(&self) -> usize {
        let maps: Vec<L1Map> = self.l1.lock().drain().map(|(_, map)| map).collect();
        maps.into_iter().map(|map| self.dispatch(map)).sum()
    }

    fn analyze(&self, kind: PayloadKind, payloads: &[Payload], out: &mut Vec<MetricRecord>) {
        let Some(analyzer) = self.analyzers.get(&kind) else {
            self.stats.record_unknown_kind(payloads.len() as u64);
            if self.warned.insert(kind) {
                warn!(kind = kind.as_str(), "No analyzer registered for payload kind, dropping");
            }
            return;
        };

        let mut analyzed = 0;
        for payload in payloads {
            match analyzer.analyze(payload, out) {
                Ok(()) => analyzed += 1,
                Err(e) => {
                    self.stats.record_invalid();
                    debug!(kind = kind.as_str(), error = %e, "Payload rejected by analyzer");
                },
            }
        }
        self.stats.record_analyzed(analyzed);
    }

    fn merge_into(&self, l1: &mut L1Map, record: MetricRecord) {
        let slot = (record.model().to_string(), record.key().clone());
        match l1.get_mut(&slot) {
            Some(existing) => {
                if let Err(e) = existing.merge(&record) {
                    self.stats.record_invalid();
                    warn!(model = %slot.0, key = %slot.1, error = %e, "L1 merge failed, record dropped");
                }
            },
            None => {
                l1.insert(slot, record);
            },
        }
    }

    fn dispatch(&self, l1: L1Map) -> usize {
        let mut sent = 0;
        for record in l1.into_values() {
            match self.target.send(Message::metric(record)) {
                Ok(Delivery::Dropped) => self.stats.record_dispatch_dropped(),
                Ok(_) => {
                    self.stats.record_dispatched();
                    sent += 1;
                },
                Err(e) => {
                    self.stats.record_remote_failure();
                    error!(role = %self.target.name(), error = %e, "Dispatch failed");
                },
            }
        }
        sent
    }
}

impl BatchHandler<Message> for IngestHandler {
    fn handle(&self, batch: Vec<Message>) -> Result<()> {
        let end_of_batch = batch.last().is_some_and(Message::is_end_of_batch);
        let thread = thread::current().id();
        let mut l1 = self.l1.lock().remove(&thread).unwrap_or_default();

        let mut groups: BTreeMap<PayloadKind, Vec<Payload>> = BTreeMap::new();
        for message in batch {
            groups.entry(message.kind()).or_default().push(message.into_payload());
        }

        let mut records = Vec::new();
        for (kind, payloads) in &groups {
            self.analyze(*kind, payloads, &mut records);
        }
        for record in records {
            self.merge_into(&mut l1, record);
        }

        if end_of_batch {
            let keys = l1.len();
            let sent = self.dispatch(l1);
            debug!(keys, sent, "L1 batch dispatched");
        } else if !l1.is_empty() {
            self.l1.lock().insert(thread, l1);
        }
        Ok(())
    }

    fn on_idle(&self) {
        let held = self.l1.lock().remove(&thread::current().id());
        if let Some(l1) = held {
            self.dispatch(l1);
        }
    }
}
