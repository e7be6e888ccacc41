//! Inter-process delivery: transport seam, per-peer clients and the receiving side.

use super::cluster::Peer;
use super::registry::RoleRegistry;
use super::worker_ref::Delivery;
use crate::channel::{BatchHandler, BatchItem, BufferStrategy, ChannelSet, ConsumerPool, Partitioner, PoolConfig};
use crate::core::{KestrelError, Message, Result};
use crate::monitoring::IngestStats;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// How remote sends wait for the receiving peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Enqueue on the peer's client queue and return.
    #[default]
    FireAndForget,
    /// Block until the peer accepted the message; failures go to the caller.
    WaitForAck,
}

/// Raw byte delivery to a named peer, assumed ordered per peer.
pub trait Transport: Send + Sync {
    /// Delivers one encoded message for `instance` of `role` on `peer`.
    fn send(&self, peer: &Peer, role: &str, instance: usize, payload: &[u8]) -> Result<()>;

    /// Starts accepting inbound messages for `address`.
    fn bind(&self, address: &str, receiver: Arc<RemoteReceiver>) -> Result<()> {
        let _ = receiver;
        Err(KestrelError::unsupported(format!("transport cannot bind {}", address)))
    }

    /// Stops accepting inbound messages for `address`.
    fn unbind(&self, _address: &str) {}
}

/// Loopback transport connecting several engines inside one process.
#[derive(Default)]
pub struct InProcessTransport {
    endpoints: DashMap<String, Arc<RemoteReceiver>>,
    failing: DashSet<String>,
    delivered: AtomicU64,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every send to `address` fail until reset.
    pub fn fail_peer(&self, address: &str, fail: bool) {
        if fail {
            self.failing.insert(address.to_string());
        } else {
            self.failing.remove(address);
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl Transport for InProcessTransport {
    fn send(&self, peer: &Peer, role: &str, instance: usize, payload: &[u8]) -> Result<()> {
        if self.failing.contains(&peer.address) {
            return Err(KestrelError::remote(&peer.address, "injected transport failure"));
        }
        let receiver = self
            .endpoints
            .get(&peer.address)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| KestrelError::remote(&peer.address, "peer unreachable"))?;

        match receiver.receive(role, instance, payload)? {
            Delivery::Dropped => Err(KestrelError::remote(&peer.address, "rejected by full queue")),
            _ => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
        }
    }

    fn bind(&self, address: &str, receiver: Arc<RemoteReceiver>) -> Result<()> {
        if self.endpoints.contains_key(address) {
            return Err(KestrelError::config(format!("address {} is already bound", address)));
        }
        self.endpoints.insert(address.to_string(), receiver);
        Ok(())
    }

    fn unbind(&self, address: &str) {
        self.endpoints.remove(address);
    }
}

/// Queued outbound message of a fire-and-forget client.
struct Outbound {
    role: String,
    instance: usize,
    message: Message,
}

impl BatchItem for Outbound {
    fn mark_end_of_batch(self) -> Self {
        self
    }
}

struct PeerLink {
    peer: Peer,
    transport: Arc<dyn Transport>,
    sent: AtomicU64,
    failures: AtomicU64,
    stats: Arc<IngestStats>,
}

impl PeerLink {
    fn deliver(&self, role: &str, instance: usize, message: &Message) -> Result<()> {
        let payload = bincode::serialize(message)?;
        match self.transport.send(&self.peer, role, instance, &payload) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.stats.record_remote_failure();
                Err(e)
            },
        }
    }
}

impl BatchHandler<Outbound> for PeerLink {
    fn handle(&self, batch: Vec<Outbound>) -> Result<()> {
        for outbound in batch {
            if let Err(e) = self.deliver(&outbound.role, outbound.instance, &outbound.message) {
                error!(peer = %self.peer.address, role = %outbound.role, error = %e, "Remote delivery failed");
            }
        }
        Ok(())
    }
}

/// Client for one remote peer.
pub struct RemoteClient {
    link: Arc<PeerLink>,
    mode: AckMode,
    queue: Option<ConsumerPool<Outbound>>,
}

impl RemoteClient {
    pub fn new(
        peer: Peer,
        transport: Arc<dyn Transport>,
        mode: AckMode,
        queue_capacity: usize,
        stats: Arc<IngestStats>,
    ) -> Result<Self> {
        let link = Arc::new(PeerLink {
            peer,
            transport,
            sent: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            stats,
        });

        let queue = match mode {
            AckMode::WaitForAck => None,
            AckMode::FireAndForget => {
                let channels = Arc::new(ChannelSet::new(
                    1,
                    queue_capacity,
                    BufferStrategy::Drop,
                    Partitioner::RoundRobin,
                )?);
                let pool = PoolConfig {
                    name: format!("remote-{}", link.peer.address),
                    ..PoolConfig::default()
                };
                Some(ConsumerPool::start(channels, Arc::clone(&link) as Arc<dyn BatchHandler<Outbound>>, pool)?)
            },
        };

        debug!(peer = %link.peer.address, ?mode, "Remote client created");
        Ok(RemoteClient { link, mode, queue })
    }

    pub fn peer(&self) -> &Peer {
        &self.link.peer
    }

    pub fn mode(&self) -> AckMode {
        self.mode
    }

    /// Forwards `message` for `instance` of `role` on this client's peer.
    pub fn send(&self, role: &str, instance: usize, message: Message) -> Result<Delivery> {
        match &self.queue {
            None => self.link.deliver(role, instance, &message).map(|()| Delivery::Delivered),
            Some(queue) => {
                let outbound = Outbound {
                    role: role.to_string(),
                    instance,
                    message,
                };
                Ok(if queue.channels().produce(outbound) {
                    Delivery::Enqueued
                } else {
                    Delivery::Dropped
                })
            },
        }
    }

    /// Messages accepted by the peer.
    pub fn sent(&self) -> u64 {
        self.link.sent.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.link.failures.load(Ordering::Relaxed)
    }

    /// Sends whatever is still queued, then stops the client thread.
    pub fn shutdown(&self) {
        if let Some(queue) = &self.queue {
            queue.shutdown();
        }
    }
}

/// Inbound side: decodes messages and hands them to the local role instance.
pub struct RemoteReceiver {
    registry: Arc<RoleRegistry>,
    received: AtomicU64,
}

impl RemoteReceiver {
    pub fn new(registry: Arc<RoleRegistry>) -> Self {
        RemoteReceiver {
            registry,
            received: AtomicU64::new(0),
        }
    }

    pub fn receive(&self, role: &str, instance: usize, payload: &[u8]) -> Result<Delivery> {
        let message: Message = bincode::deserialize(payload)?;
        let target = self.registry.lookup(role)?;
        let worker = target.instance(instance)?;
        if !worker.is_local() {
            // Peer tables disagree; forwarding again could loop.
            return Err(KestrelError::handler(format!(
                "instance {} of {} is not owned by this process",
                instance, role
            )));
        }
        self.received.fetch_add(1, Ordering::Relaxed);
        worker.send(message)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}
