//! Storage interface for aggregated metrics.
//!
//! The engine only needs batched insert-or-merge-update access keyed by
//! aggregation key. Concrete backends live outside this crate; the in-memory
//! DAO is the reference implementation used by the binary and the tests.

pub mod backend;
pub mod memory;

pub use backend::{BatchRequest, MetricsDao, UpsertRequest};
pub use memory::InMemoryMetricsDao;
