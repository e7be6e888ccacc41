//! Synthetic telemetry for demos and benchmarks.
//!
//! Produces a plausible mix of segments, service references, JVM samples
//! and heartbeats for a fixed set of services.

use crate::core::{Heartbeat, JvmSample, KestrelError, Message, Payload, Result, ServiceName, ServiceReference, TraceSegment};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Latency and error shape of one synthetic service.
#[derive(Debug, Clone)]
struct ServiceProfile {
    name: ServiceName,
    error_rate: f64,
    p50_ms: i64,
    p95_ms: i64,
    p99_ms: i64,
    endpoints: Vec<&'static str>,
}

const TEMPLATES: &[(&str, f64, i64, i64, i64, &[&str])] = &[
    ("api-gateway", 0.001, 20, 50, 100, &["GET /api/v1/users", "POST /api/v1/orders", "GET /api/v1/products"]),
    ("user-service", 0.002, 15, 40, 80, &["getUserById", "updateUser", "listUsers"]),
    ("order-service", 0.005, 30, 80, 150, &["createOrder", "getOrder", "cancelOrder"]),
    ("payment-service", 0.02, 100, 300, 500, &["processPayment", "refundPayment", "validateCard"]),
    ("inventory-service", 0.003, 10, 25, 50, &["checkStock", "reserveItems"]),
    ("notification-service", 0.01, 5, 20, 60, &["sendEmail", "sendPush"]),
];

impl ServiceProfile {
    fn latency<R: Rng>(&self, rng: &mut R) -> i64 {
        let percentile: f64 = rng.gen();
        let ms = if percentile < 0.5 {
            self.p50_ms as f64 * percentile * 2.0
        } else if percentile < 0.95 {
            let position = (percentile - 0.5) / 0.45;
            self.p50_ms as f64 + (self.p95_ms - self.p50_ms) as f64 * position
        } else {
            let position = (percentile - 0.95) / 0.05;
            self.p95_ms as f64 + (self.p99_ms - self.p95_ms) as f64 * position
        };
        let jitter = rng.gen_range(0.9..1.1);
        (ms * jitter) as i64
    }
}

/// Deterministic when seeded, otherwise seeded from the OS.
pub struct Generator {
    services: Vec<ServiceProfile>,
    rng: StdRng,
    sequence: u64,
}

impl Generator {
    pub fn new(services: usize) -> Result<Self> {
        Self::with_rng(services, StdRng::from_entropy())
    }

    pub fn seeded(services: usize, seed: u64) -> Result<Self> {
        Self::with_rng(services, StdRng::seed_from_u64(seed))
    }

    fn with_rng(services: usize, rng: StdRng) -> Result<Self> {
        if services < 2 {
            return Err(KestrelError::config("generator needs at least two services"));
        }

        let services = (0..services)
            .map(|i| {
                let (name, error_rate, p50_ms, p95_ms, p99_ms, endpoints) = TEMPLATES[i % TEMPLATES.len()];
                let name = match i / TEMPLATES.len() {
                    0 => name.to_string(),
                    round => format!("{}-{}", name, round),
                };
                Ok(ServiceProfile {
                    name: ServiceName::new(name)?,
                    error_rate,
                    p50_ms,
                    p95_ms,
                    p99_ms,
                    endpoints: endpoints.to_vec(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Generator {
            services,
            rng,
            sequence: 0,
        })
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// One message stamped at `now_ms`.
    pub fn next_message(&mut self, now_ms: i64) -> Message {
        self.sequence += 1;
        let index = self.rng.gen_range(0..self.services.len());
        let roll: f64 = self.rng.gen();

        let payload = if roll < 0.5 {
            self.segment(index, now_ms)
        } else if roll < 0.75 {
            self.reference(index, now_ms)
        } else if roll < 0.9 {
            self.jvm_sample(index, now_ms)
        } else {
            self.heartbeat(index, now_ms)
        };
        Message::new(payload)
    }

    pub fn batch(&mut self, count: usize, now_ms: i64) -> Vec<Message> {
        (0..count).map(|_| self.next_message(now_ms)).collect()
    }

    fn instance(&mut self, index: usize) -> String {
        format!("{}-{}", self.services[index].name, self.rng.gen_range(1..=3))
    }

    fn segment(&mut self, index: usize, now_ms: i64) -> Payload {
        let service = &self.services[index];
        let duration = service.latency(&mut self.rng);
        let endpoint = service.endpoints[self.rng.gen_range(0..service.endpoints.len())];
        Payload::Segment(TraceSegment {
            segment_id: format!("seg-{:016x}", self.sequence),
            service: service.name.clone(),
            endpoint: endpoint.to_string(),
            start_ms: now_ms - duration,
            end_ms: now_ms,
            is_error: self.rng.gen::<f64>() < service.error_rate,
        })
    }

    fn reference(&mut self, index: usize, now_ms: i64) -> Payload {
        // never the caller itself
        let offset = self.rng.gen_range(1..self.services.len());
        let dest = (index + offset) % self.services.len();
        let latency = self.services[dest].latency(&mut self.rng);
        Payload::Reference(ServiceReference {
            source: self.services[index].name.clone(),
            dest: self.services[dest].name.clone(),
            timestamp_ms: now_ms,
            latency_ms: latency,
            is_error: self.rng.gen::<f64>() < self.services[dest].error_rate,
        })
    }

    fn jvm_sample(&mut self, index: usize, now_ms: i64) -> Payload {
        let instance = self.instance(index);
        Payload::JvmSample(JvmSample {
            service: self.services[index].name.clone(),
            instance,
            timestamp_ms: now_ms,
            heap_used_bytes: self.rng.gen_range(64..512) * 1024 * 1024,
            cpu_percent: self.rng.gen_range(0.5..85.0),
            gc_count: (self.sequence / 100) as i64,
        })
    }

    fn heartbeat(&mut self, index: usize, now_ms: i64) -> Payload {
        let instance = self.instance(index);
        Payload::Heartbeat(Heartbeat {
            service: self.services[index].name.clone(),
            instance,
            timestamp_ms: now_ms,
        })
    }
}
