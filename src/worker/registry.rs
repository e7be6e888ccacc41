//! Role registry with two-phase construction.
//!
//! Roles are first registered with a selector, an instance factory and an
//! instance count. [`RoleRegistryBuilder::build`] then instantiates them in
//! registration order; a factory can look up every role registered before
//! its own, which is how downstream handles get wired without cycles.

use super::selector::Selector;
use super::worker_ref::{Delivery, WorkerRef};
use crate::core::{KestrelError, Message, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Lifecycle of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    /// Name and selector bound, no instances yet.
    Registered,
    /// Instances created and attached.
    Active,
}

/// Creates instance `index` of a role.
pub type WorkerFactory = Box<dyn Fn(&BuildContext, usize) -> Result<WorkerRef> + Send>;

struct PendingRole {
    name: String,
    selector: Arc<dyn Selector>,
    factory: WorkerFactory,
    count: usize,
}

/// A named class of interchangeable worker instances.
pub struct Role {
    name: String,
    selector: Arc<dyn Selector>,
    instances: Vec<WorkerRef>,
}

impl Role {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RoleState {
        RoleState::Active
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Index the selector picks for `message`.
    pub fn select(&self, message: &Message) -> usize {
        self.selector.select(self.instances.len(), message)
    }

    pub fn instance(&self, index: usize) -> Result<&WorkerRef> {
        self.instances
            .get(index)
            .ok_or_else(|| KestrelError::InstanceOutOfRange {
                role: self.name.clone(),
                index,
                count: self.instances.len(),
            })
    }

    pub fn instances(&self) -> &[WorkerRef] {
        &self.instances
    }

    /// Routes `message` to the instance chosen by the selector.
    pub fn send(&self, message: Message) -> Result<Delivery> {
        let index = self.select(&message);
        self.instances[index].send(message)
    }

    /// Routes `message` to an explicit instance.
    pub fn send_to(&self, index: usize, message: Message) -> Result<Delivery> {
        self.instance(index)?.send(message)
    }

    /// Request/response through the selected instance.
    pub fn request(&self, message: Message) -> Result<Message> {
        let index = self.select(&message);
        self.instances[index].request(message)
    }

    /// Messages waiting in local instance queues.
    pub fn pending(&self) -> usize {
        self.instances.iter().map(WorkerRef::pending).sum()
    }

    /// Drains and stops every local instance queue.
    pub fn shutdown(&self) {
        for instance in &self.instances {
            instance.shutdown();
        }
        debug!(role = %self.name, "Role queues stopped");
    }
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Role")
            .field("name", &self.name)
            .field("selector", &self.selector)
            .field("instances", &self.instances)
            .finish()
    }
}

/// Roles instantiated so far, handed to factories during `build`.
pub struct BuildContext {
    built: HashMap<String, Arc<Role>>,
    pending: Vec<String>,
}

impl BuildContext {
    /// Looks up a role built earlier in the same registry.
    pub fn role(&self, name: &str) -> Result<Arc<Role>> {
        if let Some(role) = self.built.get(name) {
            return Ok(Arc::clone(role));
        }
        if self.pending.iter().any(|p| p == name) {
            return Err(KestrelError::ProviderNotFound {
                role: name.to_string(),
                reason: "registered after the role depending on it".to_string(),
            });
        }
        Err(KestrelError::RoleNotFound(name.to_string()))
    }
}

/// First phase: collects role definitions.
#[derive(Default)]
pub struct RoleRegistryBuilder {
    roles: Vec<PendingRole>,
}

impl RoleRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` with `count` instances produced by `factory`.
    pub fn register_role<F>(
        &mut self,
        name: &str,
        selector: Arc<dyn Selector>,
        factory: F,
        count: usize,
    ) -> Result<&mut Self>
    where
        F: Fn(&BuildContext, usize) -> Result<WorkerRef> + Send + 'static,
    {
        if self.roles.iter().any(|r| r.name == name) {
            return Err(KestrelError::DuplicateRole(name.to_string()));
        }
        if count == 0 {
            return Err(KestrelError::config(format!("role {} needs at least one instance", name)));
        }

        self.roles.push(PendingRole {
            name: name.to_string(),
            selector,
            factory: Box::new(factory),
            count,
        });
        Ok(self)
    }

    /// State of a role as seen by the builder.
    pub fn state(&self, name: &str) -> Option<RoleState> {
        self.roles
            .iter()
            .any(|r| r.name == name)
            .then_some(RoleState::Registered)
    }

    /// Second phase: instantiates every role in registration order.
    pub fn build(self) -> Result<Arc<RoleRegistry>> {
        let mut ctx = BuildContext {
            built: HashMap::with_capacity(self.roles.len()),
            pending: self.roles.iter().map(|r| r.name.clone()).collect(),
        };
        let mut order = Vec::with_capacity(self.roles.len());

        for pending in self.roles {
            ctx.pending.retain(|p| *p != pending.name);

            let mut instances = Vec::with_capacity(pending.count);
            for index in 0..pending.count {
                instances.push((pending.factory)(&ctx, index)?);
            }

            let local = instances.iter().filter(|i| i.is_local()).count();
            info!(
                role = %pending.name,
                instances = pending.count,
                local,
                "Role active"
            );

            order.push(pending.name.clone());
            ctx.built.insert(
                pending.name.clone(),
                Arc::new(Role {
                    name: pending.name,
                    selector: pending.selector,
                    instances,
                }),
            );
        }

        Ok(Arc::new(RoleRegistry {
            roles: ctx.built,
            order,
        }))
    }
}

/// Immutable role table, shared by `Arc`.
pub struct RoleRegistry {
    roles: HashMap<String, Arc<Role>>,
    order: Vec<String>,
}

impl RoleRegistry {
    /// Looks up a role; absence is a configuration error.
    pub fn lookup(&self, name: &str) -> Result<Arc<Role>> {
        self.roles
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| KestrelError::RoleNotFound(name.to_string()))
    }

    /// Role names in registration order.
    pub fn role_names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

impl fmt::Debug for RoleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleRegistry").field("roles", &self.order).finish()
    }
}
