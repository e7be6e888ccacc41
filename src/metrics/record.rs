//! Metric records and their per-column merge operators.
//!
//! A [`MetricRecord`] is a named tuple of typed columns. Each column declares how
//! two partial values combine, so records for the same aggregation key can be
//! folded together in any order and any grouping.

use crate::core::{AggregationKey, Downsampling, KestrelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How two values of the same column combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeOp {
    /// Commutative accumulation (counters, latency sums). Integer sums wrap
    /// on overflow so any fold order yields the same total.
    Add,
    /// Keep the larger value.
    Max,
    /// Keep the smaller set value.
    Min,
    /// Last write wins, unset incoming values are ignored. The result depends
    /// on arrival order.
    Replace,
    /// Immutable identifier: filled once, never overwritten.
    None,
}

/// Typed column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    Long(i64),
    Double(f64),
    Text(String),
}

impl ColumnValue {
    /// True for the column's zero/unset sentinel.
    pub fn is_unset(&self) -> bool {
        match self {
            ColumnValue::Long(v) => *v == 0,
            ColumnValue::Double(v) => *v == 0.0,
            ColumnValue::Text(v) => v.is_empty(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            ColumnValue::Long(_) => "long",
            ColumnValue::Double(_) => "double",
            ColumnValue::Text(_) => "text",
        }
    }

    fn combine(&mut self, op: MergeOp, incoming: &ColumnValue) -> std::result::Result<(), String> {
        if std::mem::discriminant(self) != std::mem::discriminant(incoming) {
            return Err(format!(
                "cannot merge {} into {}",
                incoming.type_name(),
                self.type_name()
            ));
        }

        match op {
            MergeOp::Add => match (self, incoming) {
                (ColumnValue::Long(a), ColumnValue::Long(b)) => *a = a.wrapping_add(*b),
                (ColumnValue::Double(a), ColumnValue::Double(b)) => *a += *b,
                _ => return Err("text columns cannot use the add operator".to_string()),
            },
            MergeOp::Max => match (self, incoming) {
                (ColumnValue::Long(a), ColumnValue::Long(b)) => *a = (*a).max(*b),
                (ColumnValue::Double(a), ColumnValue::Double(b)) => *a = a.max(*b),
                (ColumnValue::Text(a), ColumnValue::Text(b)) => {
                    if b > a {
                        a.clone_from(b);
                    }
                },
                _ => unreachable!("discriminants checked above"),
            },
            MergeOp::Min => {
                // Unset values do not participate, otherwise a fresh record would pin the minimum to 0.
                if incoming.is_unset() {
                    return Ok(());
                }
                if self.is_unset() {
                    *self = incoming.clone();
                    return Ok(());
                }
                match (self, incoming) {
                    (ColumnValue::Long(a), ColumnValue::Long(b)) => *a = (*a).min(*b),
                    (ColumnValue::Double(a), ColumnValue::Double(b)) => *a = a.min(*b),
                    (ColumnValue::Text(a), ColumnValue::Text(b)) => {
                        if b < a {
                            a.clone_from(b);
                        }
                    },
                    _ => unreachable!("discriminants checked above"),
                }
            },
            MergeOp::Replace => {
                if !incoming.is_unset() {
                    *self = incoming.clone();
                }
            },
            MergeOp::None => {
                if self.is_unset() {
                    *self = incoming.clone();
                }
            },
        }
        Ok(())
    }
}

/// One column of a record: its merge operator and current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub op: MergeOp,
    pub value: ColumnValue,
}

/// Partially merged metric for one aggregation key of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    model: String,
    key: AggregationKey,
    downsampling: Downsampling,
    time_bucket: i64,
    entity: String,
    columns: BTreeMap<String, Column>,
}

impl MetricRecord {
    /// Creates an empty record for `entity` in the bucket containing `timestamp_ms`.
    pub fn new(model: &str, downsampling: Downsampling, timestamp_ms: i64, entity: &str) -> Self {
        MetricRecord {
            model: model.to_string(),
            key: AggregationKey::for_time(downsampling, timestamp_ms, entity),
            downsampling,
            time_bucket: downsampling.bucket_start(timestamp_ms),
            entity: entity.to_string(),
            columns: BTreeMap::new(),
        }
    }

    /// Builder-style column setter.
    pub fn column(mut self, name: &str, op: MergeOp, value: ColumnValue) -> Self {
        self.set(name, op, value);
        self
    }

    /// Adds or overwrites a column.
    pub fn set(&mut self, name: &str, op: MergeOp, value: ColumnValue) {
        self.columns.insert(name.to_string(), Column { op, value });
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn key(&self) -> &AggregationKey {
        &self.key
    }

    pub fn downsampling(&self) -> Downsampling {
        self.downsampling
    }

    /// Start of the record's time bucket, epoch milliseconds.
    pub fn time_bucket(&self) -> i64 {
        self.time_bucket
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(name, column)| (name.as_str(), column))
    }

    pub fn get(&self, name: &str) -> Option<&ColumnValue> {
        self.columns.get(name).map(|column| &column.value)
    }

    pub fn long(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(ColumnValue::Long(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn double(&self, name: &str) -> Option<f64> {
        match self.get(name) {
            Some(ColumnValue::Double(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(ColumnValue::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// True when every column holds its unset sentinel.
    pub fn is_empty_delta(&self) -> bool {
        self.columns.values().all(|column| column.value.is_unset())
    }

    /// Folds `other` into `self` column by column.
    ///
    /// Columns missing on `self` are copied over. Both records must share the
    /// model and aggregation key, and shared columns must agree on type and
    /// operator.
    pub fn merge(&mut self, other: &MetricRecord) -> Result<()> {
        if self.model != other.model || self.key != other.key {
            return Err(KestrelError::InvalidRecord(format!(
                "cannot merge {}:{} into {}:{}",
                other.model, other.key, self.model, self.key
            )));
        }

        for (name, incoming) in &other.columns {
            match self.columns.get_mut(name) {
                Some(existing) => {
                    if existing.op != incoming.op {
                        return Err(KestrelError::InvalidRecord(format!(
                            "column {} of {} declares {:?} but incoming declares {:?}",
                            name, self.model, existing.op, incoming.op
                        )));
                    }
                    existing.value.combine(existing.op, &incoming.value).map_err(|reason| {
                        KestrelError::InvalidRecord(format!("column {}: {}", name, reason))
                    })?;
                },
                None => {
                    self.columns.insert(name.clone(), incoming.clone());
                },
            }
        }

        if self.time_bucket == 0 {
            self.time_bucket = other.time_bucket;
        }
        Ok(())
    }

    /// Re-buckets this record into a coarser granularity of the time pyramid.
    pub fn downsample(&self, target: Downsampling) -> MetricRecord {
        MetricRecord {
            model: self.model.clone(),
            key: AggregationKey::for_time(target, self.time_bucket, &self.entity),
            downsampling: target,
            time_bucket: target.bucket_start(self.time_bucket),
            entity: self.entity.clone(),
            columns: self.columns.clone(),
        }
    }
}
