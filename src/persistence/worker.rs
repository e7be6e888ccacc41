//! Merge-on-flush aggregation worker.

use crate::core::{AggregationKey, Downsampling, KestrelError, Message, Payload, Result};
use crate::metrics::MetricRecord;
use crate::monitoring::IngestStats;
use crate::storage::{MetricsDao, UpsertRequest};
use crate::worker::{Delivery, Role, Worker};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Lifecycle of one worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum WorkerState {
    #[default]
    Idle,
    Accumulating,
    Flushing,
}

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Dirty keys taken from the map
    pub records: usize,
    /// Rows the store acknowledged
    pub written: usize,
    /// Rows whose write failed
    pub lost: usize,
    /// Deltas sent to coarser granularities
    pub forwarded: usize,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, HashMap<AggregationKey, MetricRecord>>,
    state: WorkerState,
}

/// Keeps partially merged records per aggregation key and upserts them on flush.
pub struct MetricsPersistentWorker {
    name: String,
    downsampling: Downsampling,
    dao: Arc<dyn MetricsDao>,
    merge_with_storage: bool,
    forwards: Vec<(Downsampling, Arc<Role>)>,
    stats: Arc<IngestStats>,
    inner: Mutex<Inner>,
}

impl MetricsPersistentWorker {
    pub fn new(
        name: &str,
        downsampling: Downsampling,
        dao: Arc<dyn MetricsDao>,
        merge_with_storage: bool,
        stats: Arc<IngestStats>,
    ) -> Self {
        MetricsPersistentWorker {
            name: name.to_string(),
            downsampling,
            dao,
            merge_with_storage,
            forwards: Vec::new(),
            stats,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Sends every flushed delta, re-bucketed to `level`, to `role`.
    pub fn forward_to(mut self, level: Downsampling, role: Arc<Role>) -> Self {
        self.forwards.push((level, role));
        self
    }

    pub fn downsampling(&self) -> Downsampling {
        self.downsampling
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lock().state
    }

    /// Number of dirty keys waiting for the next flush.
    pub fn dirty(&self) -> usize {
        self.inner.lock().records.values().map(HashMap::len).sum()
    }

    /// Current in-memory value for a key, if dirty.
    pub fn peek(&self, model: &str, key: &AggregationKey) -> Option<MetricRecord> {
        self.inner
            .lock()
            .records
            .get(model)
            .and_then(|records| records.get(key))
            .cloned()
    }

    /// Merges `record` into the in-memory map.
    pub fn accept(&self, record: MetricRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        let records = inner.records.entry(record.model().to_string()).or_default();
        match records.get_mut(record.key()) {
            Some(existing) => existing.merge(&record)?,
            None => {
                records.insert(record.key().clone(), record);
            },
        }
        if inner.state == WorkerState::Idle {
            inner.state = WorkerState::Accumulating;
        }
        Ok(())
    }

    /// Snapshots and clears the map, then writes one batch per model.
    ///
    /// Write failures are logged and counted; the cycle's delta is not requeued.
    pub fn flush(&self) -> FlushReport {
        let snapshot = {
            let mut inner = self.inner.lock();
            if inner.records.is_empty() {
                return FlushReport::default();
            }
            inner.state = WorkerState::Flushing;
            std::mem::take(&mut inner.records)
        };

        let started = Instant::now();
        let mut report = FlushReport::default();

        for (model, records) in snapshot {
            let deltas: Vec<MetricRecord> = records.into_values().collect();
            report.records += deltas.len();

            match self.write_model(&model, &deltas) {
                Ok(written) => {
                    report.written += written;
                    self.stats.record_flush(written as u64);
                },
                Err(e) => {
                    report.lost += deltas.len();
                    self.stats.record_flush_failure(deltas.len() as u64);
                    error!(
                        worker = %self.name,
                        model = %model,
                        records = deltas.len(),
                        error = %e,
                        "Flush write failed, delta dropped"
                    );
                },
            }

            report.forwarded += self.forward(&deltas);
        }

        {
            let mut inner = self.inner.lock();
            inner.state = if inner.records.is_empty() {
                WorkerState::Idle
            } else {
                WorkerState::Accumulating
            };
        }

        debug!(
            worker = %self.name,
            records = report.records,
            written = report.written,
            forwarded = report.forwarded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Flush cycle complete"
        );
        report
    }

    fn write_model(&self, model: &str, deltas: &[MetricRecord]) -> Result<usize> {
        let requests = if self.merge_with_storage {
            let keys: Vec<AggregationKey> = deltas.iter().map(|d| d.key().clone()).collect();
            let mut stored: HashMap<AggregationKey, MetricRecord> = self
                .dao
                .multi_get(model, &keys)?
                .into_iter()
                .map(|record| (record.key().clone(), record))
                .collect();

            deltas
                .iter()
                .map(|delta| match stored.remove(delta.key()) {
                    Some(mut row) => {
                        // Stored value first, delta on top: fresher Replace values win.
                        row.merge(delta)?;
                        Ok(UpsertRequest::Update(row))
                    },
                    None => Ok(UpsertRequest::Insert(delta.clone())),
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            deltas.iter().cloned().map(UpsertRequest::MergeUpsert).collect()
        };

        let batch = self.dao.prepare_batch_upsert(model, requests)?;
        self.dao
            .execute(batch)
            .map_err(|e| KestrelError::flush_write(model, e.to_string()))
    }

    fn forward(&self, deltas: &[MetricRecord]) -> usize {
        let mut forwarded = 0;
        for (level, role) in &self.forwards {
            for delta in deltas {
                match role.send(Message::metric(delta.downsample(*level))) {
                    Ok(Delivery::Dropped) => {
                        self.stats.record_dispatch_dropped();
                        warn!(worker = %self.name, role = %role.name(), "Down-sampling queue full, delta dropped");
                    },
                    Ok(_) => forwarded += 1,
                    Err(e) => {
                        self.stats.record_remote_failure();
                        error!(worker = %self.name, role = %role.name(), error = %e, "Down-sampling forward failed");
                    },
                }
            }
        }
        forwarded
    }
}

impl Worker for MetricsPersistentWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive(&self, message: Message) -> Result<()> {
        match message.into_payload() {
            Payload::Metric(record) => self.accept(record),
            other => Err(KestrelError::handler(format!(
                "{} only accepts metric records, got {}",
                self.name,
                other.kind().as_str()
            ))),
        }
    }
}
