//! Location-transparent handles to worker instances.

use super::remote::RemoteClient;
use super::Worker;
use crate::channel::{BatchHandler, BufferStrategy, ChannelSet, ConsumerPool, Partitioner, PoolConfig};
use crate::core::{KestrelError, Message, Result};
use std::fmt;
use std::sync::Arc;

/// Outcome of [`WorkerRef::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Processed (or acknowledged by the remote peer) before returning.
    Delivered,
    /// Accepted into a queue for asynchronous processing.
    Enqueued,
    /// Rejected by a full or closed queue.
    Dropped,
}

/// Queue plus dedicated consumer thread in front of one worker.
pub struct QueuedWorker {
    worker: Arc<dyn Worker>,
    pool: ConsumerPool<Message>,
}

struct DeliverBatch {
    worker: Arc<dyn Worker>,
}

impl BatchHandler<Message> for DeliverBatch {
    fn handle(&self, batch: Vec<Message>) -> Result<()> {
        for message in batch {
            self.worker.receive(message)?;
        }
        Ok(())
    }
}

/// Remote instance: the owning peer's client plus the target coordinates.
pub struct RemoteWorker {
    client: Arc<RemoteClient>,
    role: String,
    instance: usize,
}

/// Handle bound to one concrete worker instance.
pub enum WorkerRef {
    /// Synchronous call on the caller's thread.
    Direct(Arc<dyn Worker>),
    /// Enqueue and return; a dedicated consumer thread calls the worker.
    Queued(QueuedWorker),
    /// Serialize and forward to the peer owning the instance.
    Remote(RemoteWorker),
}

impl WorkerRef {
    pub fn direct(worker: Arc<dyn Worker>) -> Self {
        WorkerRef::Direct(worker)
    }

    /// Wraps `worker` behind a single-buffer queue drained by one thread.
    pub fn queued(
        worker: Arc<dyn Worker>,
        capacity: usize,
        strategy: BufferStrategy,
        mut pool: PoolConfig,
    ) -> Result<Self> {
        let channels = Arc::new(ChannelSet::new(1, capacity, strategy, Partitioner::RoundRobin)?);
        pool.threads = 1;
        let handler = Arc::new(DeliverBatch {
            worker: Arc::clone(&worker),
        });
        let pool = ConsumerPool::start(channels, handler, pool)?;
        Ok(WorkerRef::Queued(QueuedWorker { worker, pool }))
    }

    pub fn remote(client: Arc<RemoteClient>, role: &str, instance: usize) -> Self {
        WorkerRef::Remote(RemoteWorker {
            client,
            role: role.to_string(),
            instance,
        })
    }

    /// Delivers `message` without expecting a value back.
    pub fn send(&self, message: Message) -> Result<Delivery> {
        match self {
            WorkerRef::Direct(worker) => worker.receive(message).map(|()| Delivery::Delivered),
            WorkerRef::Queued(queued) => Ok(if queued.pool.channels().produce(message) {
                Delivery::Enqueued
            } else {
                Delivery::Dropped
            }),
            WorkerRef::Remote(remote) => remote.client.send(&remote.role, remote.instance, message),
        }
    }

    /// Calls the worker and returns its response. Only direct references answer.
    pub fn request(&self, message: Message) -> Result<Message> {
        match self {
            WorkerRef::Direct(worker) => worker.request(message),
            WorkerRef::Queued(_) => Err(KestrelError::unsupported("request on a queued worker")),
            WorkerRef::Remote(_) => Err(KestrelError::unsupported("request on a remote worker")),
        }
    }

    pub fn is_local(&self) -> bool {
        !matches!(self, WorkerRef::Remote(_))
    }

    /// The local worker behind this reference, if any.
    pub fn local_worker(&self) -> Option<&Arc<dyn Worker>> {
        match self {
            WorkerRef::Direct(worker) => Some(worker),
            WorkerRef::Queued(queued) => Some(&queued.worker),
            WorkerRef::Remote(_) => None,
        }
    }

    /// Messages waiting in front of a queued worker.
    pub fn pending(&self) -> usize {
        match self {
            WorkerRef::Queued(queued) => queued.pool.channels().len(),
            _ => 0,
        }
    }

    /// Stops the queue consumer after a final drain. Direct and remote references
    /// own nothing to stop; remote clients are shut down by their peer table.
    pub fn shutdown(&self) {
        if let WorkerRef::Queued(queued) = self {
            queued.pool.shutdown();
        }
    }
}

impl fmt::Debug for WorkerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerRef::Direct(worker) => write!(f, "Direct({})", worker.name()),
            WorkerRef::Queued(queued) => write!(f, "Queued({})", queued.worker.name()),
            WorkerRef::Remote(remote) => write!(
                f,
                "Remote({}:{}@{})",
                remote.role,
                remote.instance,
                remote.client.peer().address
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Heartbeat, Payload, ServiceName};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Message>>,
    }

    impl Worker for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn receive(&self, message: Message) -> Result<()> {
            self.seen.lock().push(message);
            Ok(())
        }

        fn request(&self, message: Message) -> Result<Message> {
            Ok(message.mark_end_of_batch())
        }
    }

    fn beat(instance: &str) -> Message {
        Message::new(Payload::Heartbeat(Heartbeat {
            service: ServiceName::new("svc".to_string()).unwrap(),
            instance: instance.to_string(),
            timestamp_ms: 0,
        }))
    }

    #[test]
    fn test_direct_send_and_request() {
        let recorder = Arc::new(Recorder::default());
        let direct = WorkerRef::direct(Arc::clone(&recorder) as Arc<dyn Worker>);

        assert_eq!(direct.send(beat("a")).unwrap(), Delivery::Delivered);
        assert_eq!(recorder.seen.lock().len(), 1);
        assert!(direct.request(beat("b")).unwrap().is_end_of_batch());
    }

    #[test]
    fn test_queued_send_is_fifo() {
        let recorder = Arc::new(Recorder::default());
        let queued = WorkerRef::queued(
            Arc::clone(&recorder) as Arc<dyn Worker>,
            64,
            BufferStrategy::Blocking,
            PoolConfig {
                consume_interval: Duration::from_millis(5),
                ..PoolConfig::default()
            },
        )
        .unwrap();

        for i in 0..10 {
            assert_eq!(queued.send(beat(&i.to_string())).unwrap(), Delivery::Enqueued);
        }
        assert!(queued.request(beat("x")).is_err());
        queued.shutdown();

        let seen = recorder.seen.lock();
        let order: Vec<String> = seen
            .iter()
            .map(|m| match m.payload() {
                Payload::Heartbeat(b) => b.instance.clone(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(order, (0..10).map(|i| i.to_string()).collect::<Vec<_>>());
        assert_eq!(queued.send(beat("late")).unwrap(), Delivery::Dropped);
    }
}
