//! Engine assembly.
//!
//! [`IngestPipeline`] wires the ingest channel set, its consumer pool, the
//! persistence roles of the time pyramid, the cluster clients and the flush
//! timer into one object with an ordered shutdown.

pub mod handler;

pub use handler::IngestHandler;

use crate::analysis::default_analyzers;
use crate::channel::{BatchHandler, BufferStrategy, ChannelSet, ChannelStats, ConsumerPool, PoolConfig, PoolSnapshot};
use crate::core::{Config, Downsampling, KestrelError, Message, Result};
use crate::monitoring::{IngestStats, StatsSnapshot};
use crate::persistence::{FlushReport, MetricsPersistentWorker, PersistenceTimer};
use crate::storage::{InMemoryMetricsDao, MetricsDao};
use crate::worker::{
    BuildContext, HashCodeSelector, InProcessTransport, PeerTable, RemoteClient, RemoteReceiver, RoleRegistry,
    RoleRegistryBuilder, Transport, Worker, WorkerRef,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Name of the persistence role at `level`.
pub fn role_name(level: Downsampling) -> String {
    format!("metrics_{}", level.as_str())
}

/// Everything a persistence factory needs, shared by all roles.
#[derive(Clone)]
struct PersistenceWiring {
    peers: PeerTable,
    clients: Arc<HashMap<String, Arc<RemoteClient>>>,
    dao: Arc<dyn MetricsDao>,
    stats: Arc<IngestStats>,
    config: Arc<Config>,
    workers: Arc<Mutex<Vec<Arc<MetricsPersistentWorker>>>>,
}

impl PersistenceWiring {
    fn instance(&self, ctx: &BuildContext, level: Downsampling, forwards: &[Downsampling], index: usize) -> Result<WorkerRef> {
        let role = role_name(level);
        let persistence = &self.config.persistence;

        let owner = self.peers.owner_of(index, persistence.instances);
        if !owner.is_self {
            let client = self.clients.get(&owner.address).ok_or_else(|| {
                KestrelError::config(format!("no client for peer {}", owner.address))
            })?;
            return Ok(WorkerRef::remote(Arc::clone(client), &role, index));
        }

        let name = format!("{}-{}", role, index);
        let mut worker = MetricsPersistentWorker::new(
            &name,
            level,
            Arc::clone(&self.dao),
            persistence.merge_with_storage,
            Arc::clone(&self.stats),
        );
        for coarser in forwards {
            worker = worker.forward_to(*coarser, ctx.role(&role_name(*coarser))?);
        }
        let worker = Arc::new(worker);
        self.workers.lock().push(Arc::clone(&worker));

        let consumers = &self.config.consumers;
        WorkerRef::queued(
            worker as Arc<dyn Worker>,
            persistence.queue_capacity,
            BufferStrategy::Blocking,
            PoolConfig {
                name,
                threads: 1,
                consume_interval: consumers.consume_interval,
                max_batch: consumers.max_batch,
                idle_backoff_max: consumers.idle_backoff_max,
            },
        )
    }
}

/// Assembles an [`IngestPipeline`].
pub struct PipelineBuilder {
    config: Config,
    dao: Option<Arc<dyn MetricsDao>>,
    transport: Option<Arc<dyn Transport>>,
    stats: Option<Arc<IngestStats>>,
}

impl PipelineBuilder {
    pub fn new(config: Config) -> Self {
        PipelineBuilder {
            config,
            dao: None,
            transport: None,
            stats: None,
        }
    }

    /// Storage backend. Defaults to a fresh [`InMemoryMetricsDao`].
    pub fn dao(mut self, dao: Arc<dyn MetricsDao>) -> Self {
        self.dao = Some(dao);
        self
    }

    /// Peer transport. Defaults to a private [`InProcessTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn stats(mut self, stats: Arc<IngestStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn build(self) -> Result<IngestPipeline> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let stats = self.stats.unwrap_or_default();
        let dao = self.dao.unwrap_or_else(|| Arc::new(InMemoryMetricsDao::new()));
        let transport = self.transport.unwrap_or_else(|| Arc::new(InProcessTransport::new()));

        let cluster = &config.cluster;
        let peers = PeerTable::new(&cluster.self_address, &cluster.peers)?;
        let mut clients = HashMap::new();
        for peer in peers.peers().iter().filter(|p| !p.is_self) {
            let client = RemoteClient::new(
                peer.clone(),
                Arc::clone(&transport),
                cluster.ack_mode,
                cluster.remote_queue_capacity,
                Arc::clone(&stats),
            )?;
            clients.insert(peer.address.clone(), Arc::new(client));
        }

        let wiring = PersistenceWiring {
            peers: peers.clone(),
            clients: Arc::new(clients),
            dao: Arc::clone(&dao),
            stats: Arc::clone(&stats),
            config: Arc::clone(&config),
            workers: Arc::new(Mutex::new(Vec::new())),
        };
        let instances = config.persistence.instances * peers.len();

        // Coarser levels first: the minute role resolves them while building.
        let mut coarse = config.persistence.downsampling.clone();
        coarse.sort();
        let mut builder = RoleRegistryBuilder::new();
        for level in &coarse {
            let level = *level;
            let wiring = wiring.clone();
            builder.register_role(
                &role_name(level),
                Arc::new(HashCodeSelector),
                move |ctx, index| wiring.instance(ctx, level, &[], index),
                instances,
            )?;
        }
        {
            let wiring = wiring.clone();
            let forwards = coarse.clone();
            builder.register_role(
                &role_name(Downsampling::Minute),
                Arc::new(HashCodeSelector),
                move |ctx, index| wiring.instance(ctx, Downsampling::Minute, &forwards, index),
                instances,
            )?;
        }
        let registry = builder.build()?;

        let receiver = Arc::new(RemoteReceiver::new(Arc::clone(&registry)));
        let bound = !peers.is_standalone();
        if bound {
            transport.bind(&cluster.self_address, Arc::clone(&receiver))?;
        }

        // Minute workers first so their forwards land before the coarse flush.
        let mut workers = std::mem::take(&mut *wiring.workers.lock());
        workers.sort_by_key(|worker| worker.downsampling());
        let timer = PersistenceTimer::start(workers, config.persistence.flush_interval)?;

        let handler = Arc::new(IngestHandler::new(
            default_analyzers(),
            registry.lookup(&role_name(Downsampling::Minute))?,
            Arc::clone(&stats),
        ));
        let channel = &config.channels;
        let channels = Arc::new(
            ChannelSet::new(channel.count, channel.capacity, channel.buffer_strategy(), channel.partitioner)?
                .with_batch_threshold(config.consumers.batch_threshold),
        );
        let consumers = &config.consumers;
        let pool = ConsumerPool::start(
            channels,
            Arc::clone(&handler) as Arc<dyn BatchHandler<Message>>,
            PoolConfig {
                name: "ingest".to_string(),
                threads: consumers.threads,
                consume_interval: consumers.consume_interval,
                max_batch: consumers.max_batch,
                idle_backoff_max: consumers.idle_backoff_max,
            },
        )?;

        info!(
            self_address = %cluster.self_address,
            peers = peers.len(),
            instances_per_role = instances,
            roles = registry.len(),
            "Ingest pipeline started"
        );

        Ok(IngestPipeline {
            coarse,
            stats,
            registry,
            receiver,
            peers,
            clients: wiring.clients,
            transport,
            bound,
            handler,
            pool,
            timer,
            dao,
            stopped: AtomicBool::new(false),
        })
    }
}

/// Running engine.
pub struct IngestPipeline {
    coarse: Vec<Downsampling>,
    stats: Arc<IngestStats>,
    registry: Arc<RoleRegistry>,
    receiver: Arc<RemoteReceiver>,
    peers: PeerTable,
    clients: Arc<HashMap<String, Arc<RemoteClient>>>,
    transport: Arc<dyn Transport>,
    bound: bool,
    handler: Arc<IngestHandler>,
    pool: ConsumerPool<Message>,
    timer: PersistenceTimer,
    dao: Arc<dyn MetricsDao>,
    stopped: AtomicBool,
}

impl IngestPipeline {
    pub fn builder(config: Config) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Offers a message to the ingest channels. `false` means it was not accepted.
    pub fn produce(&self, message: Message) -> bool {
        let accepted = self.pool.channels().produce(message);
        self.stats.record_produce(accepted);
        accepted
    }

    /// Like [`produce`](Self::produce), routed by an explicit partition key.
    pub fn produce_keyed<K: Hash + ?Sized>(&self, key: &K, message: Message) -> bool {
        let accepted = self.pool.channels().produce_keyed(key, message);
        self.stats.record_produce(accepted);
        accepted
    }

    /// Forces a flush of every local persistence worker.
    pub fn flush_now(&self) -> Result<FlushReport> {
        self.timer.flush_now()
    }

    /// Requests a flush without waiting for it.
    pub fn trigger_flush(&self) {
        self.timer.trigger();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn channel_stats(&self) -> ChannelStats {
        self.pool.channels().stats()
    }

    pub fn pool_stats(&self) -> PoolSnapshot {
        self.pool.stats()
    }

    pub fn registry(&self) -> &Arc<RoleRegistry> {
        &self.registry
    }

    /// Inbound side for peers of this process.
    pub fn receiver(&self) -> &Arc<RemoteReceiver> {
        &self.receiver
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn dao(&self) -> &Arc<dyn MetricsDao> {
        &self.dao
    }

    /// Stops the engine, draining each stage into the next before it stops.
    ///
    /// Order: ingest pool, minute queues and peer clients, flush, coarser
    /// queues level by level, final flush, timer. Returns the combined report
    /// of the shutdown flushes. Later calls return an empty report.
    pub fn shutdown(&self) -> Result<FlushReport> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(FlushReport::default());
        }
        info!("Shutting down ingest pipeline");

        self.pool.shutdown();
        self.handler.flush_pending();

        let mut total = FlushReport::default();
        self.registry.lookup(&role_name(Downsampling::Minute))?.shutdown();
        for client in self.clients.values() {
            client.shutdown();
        }
        add(&mut total, self.timer.flush_now()?);

        for level in &self.coarse {
            self.registry.lookup(&role_name(*level))?.shutdown();
        }
        add(&mut total, self.timer.flush_now()?);
        self.timer.shutdown();

        if self.bound {
            self.transport.unbind(&self.peers.self_peer().address);
        }

        info!(
            written = total.written,
            lost = total.lost,
            "Ingest pipeline stopped"
        );
        Ok(total)
    }
}

impl Drop for IngestPipeline {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Pipeline shutdown incomplete");
        }
    }
}

fn add(total: &mut FlushReport, report: FlushReport) {
    total.records += report.records;
    total.written += report.written;
    total.lost += report.lost;
    total.forwarded += report.forwarded;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::SERVICE_RELATION;
    use crate::core::{ConfigBuilder, Payload, ServiceName, ServiceReference};
    use std::time::Duration;

    const TS: i64 = 1_704_103_230_000;

    fn reference(latency: i64) -> Message {
        Message::new(Payload::Reference(ServiceReference {
            source: ServiceName::new("svc-A".to_string()).unwrap(),
            dest: ServiceName::new("svc-B".to_string()).unwrap(),
            timestamp_ms: TS,
            latency_ms: latency,
            is_error: false,
        }))
    }

    fn config() -> Config {
        ConfigBuilder::new()
            .channels(2)
            .consumer_threads(2)
            .consume_interval(Duration::from_millis(5))
            .flush_interval(Duration::from_secs(3600))
            .persistence_instances(2)
            .generator(false)
            .build()
            .unwrap()
    }

    #[test]
    fn test_roles_of_the_pyramid() {
        let pipeline = IngestPipeline::builder(config()).build().unwrap();
        let mut names = pipeline.registry().role_names().to_vec();
        names.sort();
        assert_eq!(names, vec!["metrics_day", "metrics_hour", "metrics_minute", "metrics_month"]);
        assert!(pipeline.peers().is_standalone());
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_persists_every_level() {
        let dao = Arc::new(InMemoryMetricsDao::new());
        let pipeline = IngestPipeline::builder(config())
            .dao(Arc::clone(&dao) as Arc<dyn MetricsDao>)
            .build()
            .unwrap();

        for latency in 1..=10 {
            assert!(pipeline.produce(reference(latency)));
        }
        pipeline.shutdown().unwrap();

        let minute = dao.records(SERVICE_RELATION);
        let levels: Vec<Downsampling> = minute.iter().map(|r| r.downsampling()).collect();
        assert_eq!(levels.len(), 4);
        for record in &minute {
            assert_eq!(record.long("calls"), Some(10), "{:?}", record.downsampling());
            assert_eq!(record.long("latency_sum"), Some(55));
        }
        assert!(pipeline.shutdown().unwrap().records == 0);
    }
}
