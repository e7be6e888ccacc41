//! Mergeable metric records.

pub mod record;

pub use record::{Column, ColumnValue, MergeOp, MetricRecord};
