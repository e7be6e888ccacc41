//! In-memory reference DAO.
//!
//! Keeps one row per `(model, aggregation key)` in a [`DashMap`] and supports
//! failure injection for reads and writes, so flush error paths can be
//! exercised without a real backend.

use super::{BatchRequest, MetricsDao, UpsertRequest};
use crate::core::{AggregationKey, KestrelError, Result};
use crate::metrics::MetricRecord;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// Reference [`MetricsDao`] backed by a concurrent hash map.
#[derive(Debug, Default)]
pub struct InMemoryMetricsDao {
    rows: DashMap<(String, AggregationKey), MetricRecord>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    batches: AtomicU64,
    rows_written: AtomicU64,
}

impl InMemoryMetricsDao {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `multi_get` fail until reset.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Makes every subsequent `execute` fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn get(&self, model: &str, key: &AggregationKey) -> Option<MetricRecord> {
        self.rows
            .get(&(model.to_string(), key.clone()))
            .map(|row| row.value().clone())
    }

    /// All rows of one model, ordered by key.
    pub fn records(&self, model: &str) -> Vec<MetricRecord> {
        let mut records: Vec<MetricRecord> = self
            .rows
            .iter()
            .filter(|row| row.key().0 == model)
            .map(|row| row.value().clone())
            .collect();
        records.sort_by(|a, b| a.key().cmp(b.key()));
        records
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of batches executed successfully.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }
}

impl MetricsDao for InMemoryMetricsDao {
    fn multi_get(&self, model: &str, keys: &[AggregationKey]) -> Result<Vec<MetricRecord>> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(KestrelError::storage(format!("injected read failure for {}", model)));
        }
        Ok(keys.iter().filter_map(|key| self.get(model, key)).collect())
    }

    fn execute(&self, batch: BatchRequest) -> Result<usize> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(KestrelError::storage(format!(
                "injected write failure for {} ({} rows)",
                batch.model(),
                batch.len()
            )));
        }

        // Resolve every row first so a failing request leaves the store untouched.
        let model = batch.model().to_string();
        let mut staged: HashMap<AggregationKey, MetricRecord> = HashMap::new();
        let mut written = 0;
        for request in batch.into_requests() {
            match request {
                UpsertRequest::Insert(record) | UpsertRequest::Update(record) => {
                    staged.insert(record.key().clone(), record);
                },
                UpsertRequest::MergeUpsert(delta) => {
                    let key = delta.key().clone();
                    let base = match staged.remove(&key) {
                        Some(row) => Some(row),
                        None => self.get(&model, &key),
                    };
                    let row = match base {
                        Some(mut row) => {
                            row.merge(&delta)?;
                            row
                        },
                        None => delta,
                    };
                    staged.insert(key, row);
                },
            }
            written += 1;
        }

        for (key, row) in staged {
            self.rows.insert((model.clone(), key), row);
        }

        self.batches.fetch_add(1, Ordering::Relaxed);
        self.rows_written.fetch_add(written as u64, Ordering::Relaxed);
        debug!(model = %model, rows = written, "Batch executed");
        Ok(written)
    }
}
