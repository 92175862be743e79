//! Channels: replicated nodes addressed by an id.
//!
//! A [`ChannelContainer`] creates one [`Channel`] per id on first access and
//! keeps it for its whole lifetime. Channels relay device operations to
//! their parent with their id added to the routing arguments, under `id`
//! and under the container name.

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::declaration::{Availability, ChannelDecl};
use crate::error::{Result, StructuralError};
use crate::node::{Node, NodeCore, RoutingArgs, SharedLock};
use crate::property::Property;
use crate::value::{ChannelId, Value};

/// Routing key holding the id of the innermost channel.
pub const CHANNEL_ID_KEY: &str = "id";

/// One instance of a replicated node.
pub struct Channel {
    id: ChannelId,
    container: String,
    core: NodeCore,
    parent: Weak<dyn Node>,
}

impl Channel {
    fn new(
        container: &str,
        id: ChannelId,
        decl: &ChannelDecl,
        parent: Weak<dyn Node>,
        lock: SharedLock,
        use_cache: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Channel>| {
            let this: Weak<dyn Node> = this.clone();
            Channel {
                id,
                container: container.to_string(),
                core: NodeCore::new(decl.node().clone(), this, lock, use_cache),
                parent,
            }
        })
    }

    /// Id of this channel in its container.
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Name of the container this channel belongs to.
    pub fn container(&self) -> &str {
        &self.container
    }

    fn attached(&self) -> Result<Arc<dyn Node>> {
        self.parent
            .upgrade()
            .ok_or_else(|| StructuralError::DetachedNode.into())
    }

    fn route(&self, mut routing: RoutingArgs) -> RoutingArgs {
        let id = Value::from(self.id.clone());
        routing
            .entry(CHANNEL_ID_KEY.to_string())
            .or_insert_with(|| id.clone());
        routing.insert(self.container.clone(), id);
        routing
    }
}

impl Node for Channel {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn as_node(&self) -> &dyn Node {
        self
    }

    fn parent(&self) -> Option<Arc<dyn Node>> {
        self.parent.upgrade()
    }

    fn resolve_read(&self, property: &Property, token: &str, routing: RoutingArgs) -> Result<Value> {
        self.attached()?
            .resolve_read(property, token, self.route(routing))
    }

    fn resolve_write(
        &self,
        property: &Property,
        token: &str,
        value: &Value,
        routing: RoutingArgs,
    ) -> Result<Value> {
        self.attached()?
            .resolve_write(property, token, value, self.route(routing))
    }

    fn resolve_check(
        &self,
        property: &Property,
        value: &Value,
        internal: &Value,
        response: &Value,
        routing: RoutingArgs,
    ) -> Result<(bool, Option<String>)> {
        self.attached()?
            .resolve_check(property, value, internal, response, self.route(routing))
    }

    fn reopen_connection(&self) -> Result<()> {
        self.attached()?.reopen_connection()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("container", &self.container)
            .field("id", &self.id)
            .field("core", &self.core)
            .finish()
    }
}

/// Lazily populated registry of the channels of one node.
pub struct ChannelContainer {
    name: String,
    decl: Arc<ChannelDecl>,
    parent: Weak<dyn Node>,
    lock: SharedLock,
    use_cache: bool,
    channels: Mutex<IndexMap<ChannelId, Arc<Channel>>>,
}

impl ChannelContainer {
    pub(crate) fn new(
        name: &str,
        decl: Arc<ChannelDecl>,
        parent: Weak<dyn Node>,
        lock: SharedLock,
        use_cache: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            decl,
            parent,
            lock,
            use_cache,
            channels: Mutex::new(IndexMap::new()),
        }
    }

    /// Container name, as declared on the parent.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical id for `id`, following aliases.
    pub fn canonical(&self, id: &ChannelId) -> ChannelId {
        self.decl.aliases.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    /// Channel `id` (or the channel an alias points to), created on first
    /// access.
    pub fn get(&self, id: impl Into<ChannelId>) -> Arc<Channel> {
        let id = self.canonical(&id.into());
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get(&id) {
            return channel.clone();
        }
        debug!(container = %self.name, %id, "Creating channel");
        let channel = Channel::new(
            &self.name,
            id.clone(),
            &self.decl,
            self.parent.clone(),
            self.lock.clone(),
            self.use_cache,
        );
        channels.insert(id, channel.clone());
        channel
    }

    /// Ids currently valid on the device, asked to the parent every time.
    pub fn available(&self) -> Result<Vec<ChannelId>> {
        match &self.decl.available {
            Some(Availability::Static(ids)) => Ok(ids.clone()),
            Some(Availability::Query(list)) => {
                let parent = self
                    .parent
                    .upgrade()
                    .ok_or(StructuralError::DetachedNode)?;
                list(parent.as_ref())
            }
            None => Err(StructuralError::MissingChannelEnumeration(self.name.clone()).into()),
        }
    }

    /// Copy of the alias to canonical id mapping.
    pub fn aliases(&self) -> IndexMap<ChannelId, ChannelId> {
        self.decl.aliases.clone()
    }

    /// One channel per available id, each at most once.
    pub fn iter(&self) -> Result<impl Iterator<Item = Arc<Channel>> + '_> {
        let ids: IndexSet<ChannelId> = self
            .available()?
            .iter()
            .map(|id| self.canonical(id))
            .collect();
        Ok(ids.into_iter().map(move |id| self.get(id)))
    }

    /// Channels created so far, in creation order.
    pub fn instantiated(&self) -> Vec<Arc<Channel>> {
        self.channels.lock().values().cloned().collect()
    }
}

impl std::fmt::Debug for ChannelContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelContainer")
            .field("name", &self.name)
            .field("decl", &self.decl)
            .field("instantiated", &self.channels.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}
