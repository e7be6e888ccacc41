//! Location-transparent worker and role dispatch.
//!
//! A [`Role`] names a class of interchangeable worker instances together with
//! a [`Selector`] that picks exactly one instance per message. Instances are
//! reached through [`WorkerRef`]s, which hide whether delivery is a direct
//! call, an enqueue, or a network hop to another collector process.

pub mod cluster;
pub mod registry;
pub mod remote;
pub mod selector;
pub mod worker_ref;

pub use cluster::{Peer, PeerTable};
pub use registry::{BuildContext, Role, RoleRegistry, RoleRegistryBuilder, RoleState, WorkerFactory};
pub use remote::{AckMode, InProcessTransport, RemoteClient, RemoteReceiver, Transport};
pub use selector::{ForeverFirstSelector, HashCodeSelector, RollingSelector, Selector};
pub use worker_ref::{Delivery, WorkerRef};

use crate::core::{KestrelError, Message, Result};

/// A unit of processing reachable through a [`WorkerRef`].
pub trait Worker: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Handles a message; no value is returned to the sender.
    fn receive(&self, message: Message) -> Result<()>;

    /// Handles a message and answers it. Most workers only accept `receive`.
    fn request(&self, message: Message) -> Result<Message> {
        let _ = message;
        Err(KestrelError::unsupported(format!("{} does not answer requests", self.name())))
    }
}
