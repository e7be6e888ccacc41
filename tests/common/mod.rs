//! Common test utilities and fixtures.
#![allow(dead_code)]

use kestrel_lib::core::{Downsampling, Heartbeat, Message, Payload, Result, ServiceName, ServiceReference, TraceSegment};
use kestrel_lib::metrics::{ColumnValue, MergeOp, MetricRecord};
use kestrel_lib::worker::Worker;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// 2024-01-01T10:00:30Z
pub const TS: i64 = 1_704_103_230_000;

/// Test fixture builder for service references with sensible defaults.
pub struct TestReferenceBuilder {
    source: String,
    dest: String,
    timestamp_ms: i64,
    latency_ms: i64,
    is_error: bool,
}

impl TestReferenceBuilder {
    pub fn new(source: &str, dest: &str) -> Self {
        Self {
            source: source.to_string(),
            dest: dest.to_string(),
            timestamp_ms: TS,
            latency_ms: 10,
            is_error: false,
        }
    }

    pub fn at(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn latency(mut self, ms: i64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn with_error(mut self) -> Self {
        self.is_error = true;
        self
    }

    pub fn build(self) -> Message {
        Message::new(Payload::Reference(ServiceReference {
            source: service(&self.source),
            dest: service(&self.dest),
            timestamp_ms: self.timestamp_ms,
            latency_ms: self.latency_ms,
            is_error: self.is_error,
        }))
    }
}

pub fn service(name: &str) -> ServiceName {
    ServiceName::new(name.to_string()).unwrap()
}

pub fn segment(id: &str, service_name: &str, endpoint: &str, duration_ms: i64) -> Message {
    Message::new(Payload::Segment(TraceSegment {
        segment_id: id.to_string(),
        service: service(service_name),
        endpoint: endpoint.to_string(),
        start_ms: TS,
        end_ms: TS + duration_ms,
        is_error: false,
    }))
}

pub fn heartbeat(service_name: &str, instance: &str) -> Message {
    Message::new(Payload::Heartbeat(Heartbeat {
        service: service(service_name),
        instance: instance.to_string(),
        timestamp_ms: TS,
    }))
}

/// Minute `total` counter record for `entity`.
pub fn total(entity: &str, value: i64) -> MetricRecord {
    MetricRecord::new("test_total", Downsampling::Minute, TS, entity)
        .column("entity_id", MergeOp::None, ColumnValue::Text(entity.to_string()))
        .column("total", MergeOp::Add, ColumnValue::Long(value))
}

/// Worker that keeps every message it receives.
#[derive(Default)]
pub struct RecordingWorker {
    name: String,
    pub seen: Mutex<Vec<Message>>,
}

impl RecordingWorker {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn routing_keys(&self) -> Vec<String> {
        self.seen.lock().iter().map(|m| m.routing_key().into_owned()).collect()
    }
}

impl Worker for RecordingWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive(&self, message: Message) -> Result<()> {
        self.seen.lock().push(message);
        Ok(())
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Macro for creating a reference message quickly.
#[macro_export]
macro_rules! reference {
    ($source:expr => $dest:expr) => {
        TestReferenceBuilder::new($source, $dest).build()
    };
    ($source:expr => $dest:expr, latency: $latency:expr) => {
        TestReferenceBuilder::new($source, $dest).latency($latency).build()
    };
    ($source:expr => $dest:expr, error) => {
        TestReferenceBuilder::new($source, $dest).with_error().build()
    };
}
