//! Nodes: the scopes properties are accessed through.
//!
//! An instrument is a tree of nodes. The root ([`Instrument`]) owns the
//! transport; [`Subsystem`]s and [`Channel`]s are thin relays forwarding
//! device operations to their parent. Every node of a tree shares the lock
//! created by the root, so any two property accesses on the same instrument
//! are serialized whatever node they go through.
//!
//! Properties elsewhere in the tree are addressed with dotted paths:
//!
//! - `"voltage"` - property of this node
//! - `"output.voltage"` - property of subsystem `output`
//! - `".voltage"` - property of the parent node (one leading dot per level)
//! - `"ch.voltage"` - every instantiated channel of container `ch`
//!   (cache operations only)
//!
//! [`Instrument`]: crate::instrument::Instrument
//! [`Subsystem`]: crate::subsystem::Subsystem
//! [`Channel`]: crate::channel::Channel

use indexmap::IndexMap;
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use crate::channel::ChannelContainer;
use crate::declaration::NodeDecl;
use crate::error::{Result, StructuralError};
use crate::limits::{LimitsStore, LimitsValidator};
use crate::property::Property;
use crate::subsystem::Subsystem;
use crate::value::{ChannelId, Value};

/// Serialization lock shared by every node of an instrument.
pub type SharedLock = Arc<ReentrantMutex<()>>;

/// Addressing information added by relay nodes on the way to the root.
pub type RoutingArgs = BTreeMap<String, Value>;

/// Last known values of a node's properties.
#[derive(Debug, Default)]
pub struct PropertyCache {
    values: Mutex<HashMap<String, Value>>,
}

impl PropertyCache {
    /// Cached value of `name`.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.lock().get(name).cloned()
    }

    /// Store `value` for `name`.
    pub fn insert(&self, name: &str, value: Value) {
        self.values.lock().insert(name.to_string(), value);
    }

    /// Forget `name`, returning its last value.
    pub fn remove(&self, name: &str) -> Option<Value> {
        self.values.lock().remove(name)
    }

    /// Forget every value.
    pub fn clear(&self) {
        self.values.lock().clear();
    }

    /// Whether `name` is cached.
    pub fn contains(&self, name: &str) -> bool {
        self.values.lock().contains_key(name)
    }

    /// Copy of the cached values.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.values
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// State owned by every node.
pub struct NodeCore {
    decl: Arc<NodeDecl>,
    pub(crate) lock: SharedLock,
    cache: PropertyCache,
    use_cache: bool,
    limits: LimitsStore,
    subsystems: IndexMap<String, Arc<Subsystem>>,
    channels: IndexMap<String, ChannelContainer>,
}

impl NodeCore {
    /// Build the core of a node and instantiate its subsystems and channel
    /// containers. `this` is the node being built.
    pub fn new(decl: Arc<NodeDecl>, this: Weak<dyn Node>, lock: SharedLock, use_cache: bool) -> Self {
        let subsystems = decl
            .subsystems()
            .map(|(name, sub)| {
                let node = Subsystem::new(name, sub.clone(), this.clone(), lock.clone(), use_cache);
                (name.to_string(), node)
            })
            .collect();
        let channels = decl
            .channels()
            .map(|(name, ch)| {
                let container =
                    ChannelContainer::new(name, ch.clone(), this.clone(), lock.clone(), use_cache);
                (name.to_string(), container)
            })
            .collect();

        Self {
            decl,
            lock,
            cache: PropertyCache::default(),
            use_cache,
            limits: LimitsStore::new(),
            subsystems,
            channels,
        }
    }

    /// Core of a root node, which creates the instrument lock.
    pub fn new_root(decl: Arc<NodeDecl>, this: Weak<dyn Node>, use_cache: bool) -> Self {
        Self::new(decl, this, Arc::new(ReentrantMutex::new(())), use_cache)
    }
}

impl std::fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCore")
            .field("properties", &self.decl.property_names())
            .field("cache", &self.cache)
            .field("use_cache", &self.use_cache)
            .field("subsystems", &self.subsystems.keys().collect::<Vec<_>>())
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Operations a property chain needs from the node it runs on.
pub trait Node: Send + Sync {
    /// Shared state of the node.
    fn core(&self) -> &NodeCore;

    /// `self` as a trait object.
    fn as_node(&self) -> &dyn Node;

    /// Parent node, `None` for the root (or a detached relay).
    fn parent(&self) -> Option<Arc<dyn Node>>;

    /// Query the device for `property` using the getter `token`.
    fn resolve_read(&self, property: &Property, token: &str, routing: RoutingArgs) -> Result<Value>;

    /// Send `value` for `property` using the setter `token`, returns the response.
    fn resolve_write(
        &self,
        property: &Property,
        token: &str,
        value: &Value,
        routing: RoutingArgs,
    ) -> Result<Value>;

    /// Decide whether a write took effect, with optional details on failure.
    fn resolve_check(
        &self,
        property: &Property,
        value: &Value,
        internal: &Value,
        response: &Value,
        routing: RoutingArgs,
    ) -> Result<(bool, Option<String>)>;

    /// Reopen the communication session after a recoverable failure.
    fn reopen_connection(&self) -> Result<()>;

    fn lock(&self) -> &SharedLock {
        &self.core().lock
    }

    fn cache(&self) -> &PropertyCache {
        &self.core().cache
    }

    fn use_cache(&self) -> bool {
        self.core().use_cache
    }

    fn declaration(&self) -> &Arc<NodeDecl> {
        &self.core().decl
    }

    fn subsystem(&self, name: &str) -> Result<Arc<Subsystem>> {
        self.core()
            .subsystems
            .get(name)
            .cloned()
            .ok_or_else(|| StructuralError::UnknownSubsystem(name.to_string()).into())
    }

    fn channel(&self, name: &str) -> Result<&ChannelContainer> {
        self.core()
            .channels
            .get(name)
            .ok_or_else(|| StructuralError::UnknownChannel(name.to_string()).into())
    }

    fn subsystem_names(&self) -> Vec<String> {
        self.core().subsystems.keys().cloned().collect()
    }

    fn channel_names(&self) -> Vec<String> {
        self.core().channels.keys().cloned().collect()
    }
}

/// Which caches a cache operation touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheScope {
    /// Recurse into subsystems
    pub subsystems: bool,
    /// Recurse into instantiated channels
    pub channels: bool,
    /// Restrict to these property paths; recursion flags are then ignored
    pub properties: Option<Vec<String>>,
}

impl Default for CacheScope {
    fn default() -> Self {
        Self::all()
    }
}

impl CacheScope {
    /// Every property of the node and its descendants.
    pub fn all() -> Self {
        Self {
            subsystems: true,
            channels: true,
            properties: None,
        }
    }

    /// Only the listed property paths.
    pub fn properties<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            properties: Some(paths.into_iter().map(Into::into).collect()),
            ..Self::all()
        }
    }

    /// Skip subsystems.
    pub fn without_subsystems(mut self) -> Self {
        self.subsystems = false;
        self
    }

    /// Skip channels.
    pub fn without_channels(mut self) -> Self {
        self.channels = false;
        self
    }
}

/// Cached values of a node and of its children.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheSnapshot {
    /// Values cached on the node itself
    pub values: BTreeMap<String, Value>,
    /// Snapshots of the subsystems
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub subsystems: BTreeMap<String, CacheSnapshot>,
    /// Instantiated channels only
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub channels: BTreeMap<String, BTreeMap<ChannelId, CacheSnapshot>>,
}

/// Path based operations available on every node.
pub trait NodeExt: Node {
    /// Declared property `name` of this node.
    fn property(&self, name: &str) -> Result<Arc<Property>> {
        self.declaration().property(name)
    }

    /// Read the property at `path`.
    fn read(&self, path: &str) -> Result<Value> {
        locate(self.as_node(), path, &segments(path), |node, name| {
            node.property(name)?.read(node)
        })
    }

    /// Write the property at `path`.
    fn write(&self, path: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        locate(self.as_node(), path, &segments(path), move |node, name| {
            node.property(name)?.write(node, value)
        })
    }

    /// Drop cached values in `scope`.
    fn clear_cache(&self, scope: &CacheScope) -> Result<()> {
        if let Some(paths) = &scope.properties {
            return self.discard_cached(paths);
        }
        let node = self.as_node();
        let _guard = node.lock().lock();
        node.cache().clear();
        if scope.subsystems {
            for sub in node.core().subsystems.values() {
                sub.clear_cache(scope)?;
            }
        }
        if scope.channels {
            for container in node.core().channels.values() {
                for channel in container.instantiated() {
                    channel.clear_cache(scope)?;
                }
            }
        }
        Ok(())
    }

    /// Drop the cached values of the properties at `paths`.
    fn discard_cached(&self, paths: &[String]) -> Result<()> {
        let node = self.as_node();
        let _guard = node.lock().lock();
        for path in paths {
            discard_path(node, path, &segments(path))?;
        }
        Ok(())
    }

    /// Collect cached values in `scope`.
    fn check_cache(&self, scope: &CacheScope) -> Result<CacheSnapshot> {
        let node = self.as_node();
        let _guard = node.lock().lock();
        let mut snapshot = CacheSnapshot::default();
        match &scope.properties {
            Some(paths) => {
                for path in paths {
                    snapshot_path(node, path, &segments(path), &mut snapshot)?;
                }
            }
            None => snapshot_all(node, scope, &mut snapshot),
        }
        Ok(snapshot)
    }

    /// Limits declared under `id`, fetched once and memoized on this node.
    fn get_limits(&self, id: &str) -> Result<LimitsValidator> {
        let node = self.as_node();
        if let Some(limits) = node.core().limits.get(id) {
            return Ok(limits);
        }
        let provider = node
            .declaration()
            .limits_provider(id)
            .ok_or_else(|| StructuralError::UnknownLimits(id.to_string()))?;
        let limits = provider(node)?;
        node.core().limits.insert(id, limits.clone());
        Ok(limits)
    }

    /// Forget memoized limits, all of them when `ids` is `None`.
    fn discard_limits(&self, ids: Option<&[String]>) {
        self.core().limits.discard(ids);
    }

    /// Ids of the limits declared on this node.
    fn declared_limits(&self) -> Vec<String> {
        self.declaration().limits_ids()
    }
}

impl<N: Node + ?Sized> NodeExt for N {}

fn segments(path: &str) -> Vec<&str> {
    path.split('.').collect()
}

fn invalid(path: &str) -> crate::error::PropertyError {
    StructuralError::InvalidPath(path.to_string()).into()
}

/// Walk `segs` down (or up) the tree and run `f` with the final node and
/// property name.
fn locate<R, F>(node: &dyn Node, path: &str, segs: &[&str], f: F) -> Result<R>
where
    F: FnOnce(&dyn Node, &str) -> Result<R>,
{
    match segs {
        [] => Err(invalid(path)),
        [name] if name.is_empty() => Err(invalid(path)),
        [name] => f(node, name),
        ["", rest @ ..] => {
            let parent = node.parent().ok_or_else(|| invalid(path))?;
            locate(parent.as_ref(), path, rest, f)
        }
        [sub, rest @ ..] => {
            let sub = node.subsystem(sub)?;
            locate(sub.as_ref(), path, rest, f)
        }
    }
}

fn discard_path(node: &dyn Node, path: &str, segs: &[&str]) -> Result<()> {
    match segs {
        [] => Err(invalid(path)),
        [name] if name.is_empty() => Err(invalid(path)),
        [name] => {
            node.cache().remove(name);
            Ok(())
        }
        ["", rest @ ..] => {
            let parent = node.parent().ok_or_else(|| invalid(path))?;
            discard_path(parent.as_ref(), path, rest)
        }
        [child, rest @ ..] => {
            if let Ok(container) = node.channel(child) {
                for channel in container.instantiated() {
                    discard_path(channel.as_ref(), path, rest)?;
                }
                return Ok(());
            }
            let sub = node.subsystem(child)?;
            discard_path(sub.as_ref(), path, rest)
        }
    }
}

fn snapshot_path(node: &dyn Node, path: &str, segs: &[&str], snapshot: &mut CacheSnapshot) -> Result<()> {
    match segs {
        [] => Err(invalid(path)),
        [name] if name.is_empty() => Err(invalid(path)),
        [name] => {
            if let Some(value) = node.cache().get(name) {
                snapshot.values.insert(name.to_string(), value);
            }
            Ok(())
        }
        // Parent values have no place in a child snapshot
        ["", ..] => Err(invalid(path)),
        [child, rest @ ..] => {
            if let Ok(container) = node.channel(child) {
                for channel in container.instantiated() {
                    let entry = snapshot
                        .channels
                        .entry(child.to_string())
                        .or_default()
                        .entry(channel.id().clone())
                        .or_default();
                    snapshot_path(channel.as_ref(), path, rest, entry)?;
                }
                return Ok(());
            }
            let sub = node.subsystem(child)?;
            let entry = snapshot.subsystems.entry(child.to_string()).or_default();
            snapshot_path(sub.as_ref(), path, rest, entry)
        }
    }
}

fn snapshot_all(node: &dyn Node, scope: &CacheScope, snapshot: &mut CacheSnapshot) {
    snapshot.values = node.cache().snapshot();
    if scope.subsystems {
        for (name, sub) in &node.core().subsystems {
            let entry = snapshot.subsystems.entry(name.clone()).or_default();
            snapshot_all(sub.as_ref(), scope, entry);
        }
    }
    if scope.channels {
        for (name, container) in &node.core().channels {
            for channel in container.instantiated() {
                let entry = snapshot
                    .channels
                    .entry(name.clone())
                    .or_default()
                    .entry(channel.id().clone())
                    .or_default();
                snapshot_all(channel.as_ref(), scope, entry);
            }
        }
    }
}
