//! Storage DAO trait used by the flush step.

use crate::core::{AggregationKey, KestrelError, Result};
use crate::metrics::MetricRecord;
use std::time::Instant;

/// One row of a batched upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertRequest {
    /// Row did not exist when the batch was prepared.
    Insert(MetricRecord),
    /// Full replacement of an existing row (already merged against storage).
    Update(MetricRecord),
    /// Delta to merge into whatever the store holds, inserting if absent.
    MergeUpsert(MetricRecord),
}

impl UpsertRequest {
    pub fn record(&self) -> &MetricRecord {
        match self {
            UpsertRequest::Insert(r) | UpsertRequest::Update(r) | UpsertRequest::MergeUpsert(r) => r,
        }
    }
}

/// Prepared batch handed to [`MetricsDao::execute`].
#[derive(Debug, Clone)]
pub struct BatchRequest {
    model: String,
    requests: Vec<UpsertRequest>,
    prepared_at: Instant,
}

impl BatchRequest {
    /// Builds a batch; every request must belong to `model`.
    pub fn new(model: &str, requests: Vec<UpsertRequest>) -> Result<Self> {
        if let Some(stray) = requests.iter().find(|r| r.record().model() != model) {
            return Err(KestrelError::InvalidRecord(format!(
                "record of model {} in a batch for {}",
                stray.record().model(),
                model
            )));
        }
        Ok(BatchRequest {
            model: model.to_string(),
            requests,
            prepared_at: Instant::now(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn requests(&self) -> &[UpsertRequest] {
        &self.requests
    }

    pub fn into_requests(self) -> Vec<UpsertRequest> {
        self.requests
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn prepared_at(&self) -> Instant {
        self.prepared_at
    }
}

/// Insert-or-merge-update access to persisted metric rows.
///
/// Implementations must be safe to call from several flush threads at once.
pub trait MetricsDao: Send + Sync {
    /// Reads the stored rows for `keys`. Missing keys are simply absent from the result.
    fn multi_get(&self, model: &str, keys: &[AggregationKey]) -> Result<Vec<MetricRecord>>;

    /// Turns upsert requests into one executable batch.
    fn prepare_batch_upsert(&self, model: &str, requests: Vec<UpsertRequest>) -> Result<BatchRequest> {
        BatchRequest::new(model, requests)
    }

    /// Executes a prepared batch and returns the number of rows written.
    fn execute(&self, batch: BatchRequest) -> Result<usize>;
}
