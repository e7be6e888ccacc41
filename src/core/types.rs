use crate::core::error::{KestrelError, Result};
use crate::metrics::MetricRecord;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Service name identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceName(String);

impl ServiceName {
    /// Creates a new ServiceName after validation
    pub fn new(name: String) -> Result<Self> {
        if name.is_empty() {
            return Err(KestrelError::InvalidRecord("ServiceName cannot be empty".to_string()));
        }
        if name.len() > 255 {
            return Err(KestrelError::InvalidRecord(
                "ServiceName cannot exceed 255 characters".to_string(),
            ));
        }
        Ok(ServiceName(name))
    }

    /// Returns the string representation of the service name
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the inner string value
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Granularity of a time bucket in the time pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Downsampling {
    Minute,
    Hour,
    Day,
    Month,
}

impl Downsampling {
    /// Start of the bucket containing `timestamp_ms`, in epoch milliseconds (UTC).
    pub fn bucket_start(self, timestamp_ms: i64) -> i64 {
        match self {
            Downsampling::Minute => timestamp_ms - timestamp_ms.rem_euclid(60_000),
            Downsampling::Hour => timestamp_ms - timestamp_ms.rem_euclid(3_600_000),
            Downsampling::Day => timestamp_ms - timestamp_ms.rem_euclid(86_400_000),
            Downsampling::Month => {
                let dt = to_datetime(timestamp_ms);
                Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
                    .single()
                    .map_or(0, |start| start.timestamp_millis())
            },
        }
    }

    /// Human readable bucket label used as the time part of aggregation keys.
    pub fn label(self, timestamp_ms: i64) -> String {
        let dt = to_datetime(timestamp_ms);
        let pattern = match self {
            Downsampling::Minute => "%Y-%m-%d-%H:%M",
            Downsampling::Hour => "%Y-%m-%d-%H",
            Downsampling::Day => "%Y-%m-%d",
            Downsampling::Month => "%Y-%m",
        };
        dt.format(pattern).to_string()
    }

    /// Lowercase name, used in role and model names.
    pub fn as_str(self) -> &'static str {
        match self {
            Downsampling::Minute => "minute",
            Downsampling::Hour => "hour",
            Downsampling::Day => "day",
            Downsampling::Month => "month",
        }
    }
}

fn to_datetime(timestamp_ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(timestamp_ms).unwrap_or_default()
}

/// Composite key identifying one logical metric series: `<time bucket>|<entity id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregationKey(String);

impl AggregationKey {
    /// Builds a key from an already rendered bucket label and an entity id.
    pub fn new(bucket: &str, entity: &str) -> Self {
        AggregationKey(format!("{}|{}", bucket, entity))
    }

    /// Builds the key of `entity` for the bucket containing `timestamp_ms`.
    pub fn for_time(downsampling: Downsampling, timestamp_ms: i64, entity: &str) -> Self {
        Self::new(&downsampling.label(timestamp_ms), entity)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Time bucket part of the key (everything before the first `|`).
    pub fn time_bucket(&self) -> &str {
        self.0.split_once('|').map_or(self.0.as_str(), |(bucket, _)| bucket)
    }

    /// Entity part of the key (everything after the first `|`).
    pub fn entity(&self) -> &str {
        self.0.split_once('|').map_or("", |(_, entity)| entity)
    }
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One finished trace segment reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSegment {
    pub segment_id: String,
    pub service: ServiceName,
    pub endpoint: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub is_error: bool,
}

impl TraceSegment {
    /// Segment duration in milliseconds, never negative.
    pub fn duration_ms(&self) -> i64 {
        (self.end_ms - self.start_ms).max(0)
    }
}

/// A service-to-service call computed from segment references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceReference {
    pub source: ServiceName,
    pub dest: ServiceName,
    pub timestamp_ms: i64,
    pub latency_ms: i64,
    pub is_error: bool,
}

/// Runtime sample of one JVM instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JvmSample {
    pub service: ServiceName,
    pub instance: String,
    pub timestamp_ms: i64,
    pub heap_used_bytes: i64,
    pub cpu_percent: f64,
    pub gc_count: i64,
}

/// Liveness ping of one service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub service: ServiceName,
    pub instance: String,
    pub timestamp_ms: i64,
}

/// Discriminated payload of a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Segment(TraceSegment),
    Reference(ServiceReference),
    JvmSample(JvmSample),
    Heartbeat(Heartbeat),
    /// Partially merged record travelling between workers.
    Metric(MetricRecord),
}

/// Tag of a [`Payload`] variant, used for handler lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Segment,
    Reference,
    JvmSample,
    Heartbeat,
    Metric,
}

impl PayloadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadKind::Segment => "segment",
            PayloadKind::Reference => "reference",
            PayloadKind::JvmSample => "jvm_sample",
            PayloadKind::Heartbeat => "heartbeat",
            PayloadKind::Metric => "metric",
        }
    }
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Segment(_) => PayloadKind::Segment,
            Payload::Reference(_) => PayloadKind::Reference,
            Payload::JvmSample(_) => PayloadKind::JvmSample,
            Payload::Heartbeat(_) => PayloadKind::Heartbeat,
            Payload::Metric(_) => PayloadKind::Metric,
        }
    }
}

/// Immutable unit of work flowing through channels and workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    payload: Payload,
    end_of_batch: bool,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Message {
            payload,
            end_of_batch: false,
        }
    }

    /// Wraps a metric record.
    pub fn metric(record: MetricRecord) -> Self {
        Self::new(Payload::Metric(record))
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn kind(&self) -> PayloadKind {
        self.payload.kind()
    }

    pub fn is_end_of_batch(&self) -> bool {
        self.end_of_batch
    }

    /// Returns the same message flagged as the last item of a drain cycle.
    pub fn mark_end_of_batch(mut self) -> Self {
        self.end_of_batch = true;
        self
    }

    /// Key used by hash-based selectors. Equal aggregation keys always yield
    /// equal routing keys.
    pub fn routing_key(&self) -> Cow<'_, str> {
        match &self.payload {
            Payload::Metric(record) => Cow::Borrowed(record.key().as_str()),
            Payload::Segment(segment) => Cow::Borrowed(segment.segment_id.as_str()),
            Payload::Reference(reference) => {
                Cow::Owned(format!("{}->{}", reference.source, reference.dest))
            },
            Payload::JvmSample(sample) => {
                Cow::Owned(format!("{}/{}", sample.service, sample.instance))
            },
            Payload::Heartbeat(beat) => Cow::Owned(format!("{}/{}", beat.service, beat.instance)),
        }
    }
}
