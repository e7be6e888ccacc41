//! Merge-on-flush persistence.
//!
//! [`MetricsPersistentWorker`] folds every update for an aggregation key into a
//! single in-memory record; [`PersistenceTimer`] periodically (or on demand)
//! snapshots those maps and upserts them through a
//! [`MetricsDao`](crate::storage::MetricsDao).

pub mod timer;
pub mod worker;

pub use timer::PersistenceTimer;
pub use worker::{FlushReport, MetricsPersistentWorker, WorkerState};
