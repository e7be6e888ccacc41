//! Payload analysis: turns decoded telemetry into minute-level metric records.

use crate::core::{Downsampling, KestrelError, Payload, PayloadKind, Result};
use crate::metrics::{ColumnValue, MergeOp, MetricRecord};

pub const SERVICE_RELATION: &str = "service_relation";
pub const SERVICE_TRAFFIC: &str = "service_traffic";
pub const ENDPOINT_TRAFFIC: &str = "endpoint_traffic";
pub const INSTANCE_JVM: &str = "instance_jvm";
pub const INSTANCE_HEARTBEAT: &str = "instance_heartbeat";

/// Produces metric records from one payload kind.
pub trait Analyzer: Send + Sync {
    fn kind(&self) -> PayloadKind;

    /// Appends the records derived from `payload` to `out`.
    fn analyze(&self, payload: &Payload, out: &mut Vec<MetricRecord>) -> Result<()>;
}

fn mismatch(expected: PayloadKind, payload: &Payload) -> KestrelError {
    KestrelError::InvalidRecord(format!(
        "expected {} payload, got {}",
        expected.as_str(),
        payload.kind().as_str()
    ))
}

fn text(value: &str) -> ColumnValue {
    ColumnValue::Text(value.to_string())
}

/// Service-to-service call metrics from computed references.
#[derive(Debug, Default)]
pub struct ServiceRelationAnalyzer;

impl Analyzer for ServiceRelationAnalyzer {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Reference
    }

    fn analyze(&self, payload: &Payload, out: &mut Vec<MetricRecord>) -> Result<()> {
        let Payload::Reference(reference) = payload else {
            return Err(mismatch(self.kind(), payload));
        };
        if reference.source == reference.dest {
            return Err(KestrelError::InvalidRecord(format!(
                "self reference on {}",
                reference.source
            )));
        }

        let entity = format!("{}->{}", reference.source, reference.dest);
        out.push(
            MetricRecord::new(SERVICE_RELATION, Downsampling::Minute, reference.timestamp_ms, &entity)
                .column("entity_id", MergeOp::None, text(&entity))
                .column("source", MergeOp::None, text(reference.source.as_str()))
                .column("dest", MergeOp::None, text(reference.dest.as_str()))
                .column("calls", MergeOp::Add, ColumnValue::Long(1))
                .column("errors", MergeOp::Add, ColumnValue::Long(i64::from(reference.is_error)))
                .column("latency_sum", MergeOp::Add, ColumnValue::Long(reference.latency_ms))
                .column("latency_max", MergeOp::Max, ColumnValue::Long(reference.latency_ms)),
        );
        Ok(())
    }
}

/// Endpoint and service traffic from finished segments.
#[derive(Debug, Default)]
pub struct TrafficAnalyzer;

impl Analyzer for TrafficAnalyzer {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Segment
    }

    fn analyze(&self, payload: &Payload, out: &mut Vec<MetricRecord>) -> Result<()> {
        let Payload::Segment(segment) = payload else {
            return Err(mismatch(self.kind(), payload));
        };
        if segment.end_ms < segment.start_ms {
            return Err(KestrelError::InvalidRecord(format!(
                "segment {} ends before it starts",
                segment.segment_id
            )));
        }

        let duration = segment.duration_ms();
        let errors = i64::from(segment.is_error);
        let service = segment.service.as_str();
        let endpoint = format!("{}/{}", service, segment.endpoint);

        out.push(
            MetricRecord::new(ENDPOINT_TRAFFIC, Downsampling::Minute, segment.start_ms, &endpoint)
                .column("entity_id", MergeOp::None, text(&endpoint))
                .column("service", MergeOp::None, text(service))
                .column("calls", MergeOp::Add, ColumnValue::Long(1))
                .column("errors", MergeOp::Add, ColumnValue::Long(errors))
                .column("latency_sum", MergeOp::Add, ColumnValue::Long(duration))
                .column("latency_max", MergeOp::Max, ColumnValue::Long(duration))
                .column("latency_min", MergeOp::Min, ColumnValue::Long(duration)),
        );
        out.push(
            MetricRecord::new(SERVICE_TRAFFIC, Downsampling::Minute, segment.start_ms, service)
                .column("entity_id", MergeOp::None, text(service))
                .column("calls", MergeOp::Add, ColumnValue::Long(1))
                .column("errors", MergeOp::Add, ColumnValue::Long(errors))
                .column("latency_sum", MergeOp::Add, ColumnValue::Long(duration)),
        );
        Ok(())
    }
}

/// Per-instance JVM resource metrics.
#[derive(Debug, Default)]
pub struct InstanceJvmAnalyzer;

impl Analyzer for InstanceJvmAnalyzer {
    fn kind(&self) -> PayloadKind {
        PayloadKind::JvmSample
    }

    fn analyze(&self, payload: &Payload, out: &mut Vec<MetricRecord>) -> Result<()> {
        let Payload::JvmSample(sample) = payload else {
            return Err(mismatch(self.kind(), payload));
        };

        let entity = format!("{}/{}", sample.service, sample.instance);
        out.push(
            MetricRecord::new(INSTANCE_JVM, Downsampling::Minute, sample.timestamp_ms, &entity)
                .column("entity_id", MergeOp::None, text(&entity))
                .column("samples", MergeOp::Add, ColumnValue::Long(1))
                .column("heap_sum", MergeOp::Add, ColumnValue::Long(sample.heap_used_bytes))
                .column("heap_max", MergeOp::Max, ColumnValue::Long(sample.heap_used_bytes))
                .column("cpu_sum", MergeOp::Add, ColumnValue::Double(sample.cpu_percent))
                // gc_count is a cumulative counter on the agent side
                .column("gc_count", MergeOp::Max, ColumnValue::Long(sample.gc_count)),
        );
        Ok(())
    }
}

/// Instance liveness.
#[derive(Debug, Default)]
pub struct HeartbeatAnalyzer;

impl Analyzer for HeartbeatAnalyzer {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Heartbeat
    }

    fn analyze(&self, payload: &Payload, out: &mut Vec<MetricRecord>) -> Result<()> {
        let Payload::Heartbeat(beat) = payload else {
            return Err(mismatch(self.kind(), payload));
        };

        let entity = format!("{}/{}", beat.service, beat.instance);
        out.push(
            MetricRecord::new(INSTANCE_HEARTBEAT, Downsampling::Minute, beat.timestamp_ms, &entity)
                .column("entity_id", MergeOp::None, text(&entity))
                .column("beats", MergeOp::Add, ColumnValue::Long(1))
                .column("last_seen", MergeOp::Replace, ColumnValue::Long(beat.timestamp_ms)),
        );
        Ok(())
    }
}

/// Pre-aggregated records produced elsewhere pass through unchanged.
#[derive(Debug, Default)]
pub struct MetricPassthrough;

impl Analyzer for MetricPassthrough {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Metric
    }

    fn analyze(&self, payload: &Payload, out: &mut Vec<MetricRecord>) -> Result<()> {
        let Payload::Metric(record) = payload else {
            return Err(mismatch(self.kind(), payload));
        };
        out.push(record.clone());
        Ok(())
    }
}

/// Every built-in analyzer.
pub fn default_analyzers() -> Vec<Box<dyn Analyzer>> {
    vec![
        Box::new(ServiceRelationAnalyzer),
        Box::new(TrafficAnalyzer),
        Box::new(InstanceJvmAnalyzer),
        Box::new(HeartbeatAnalyzer),
        Box::new(MetricPassthrough),
    ]
}
