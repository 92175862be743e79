//! Class-level node declarations.
//!
//! A [`NodeDecl`] lists what every instance of a node type exposes:
//! properties, nested subsystems, channel containers and named limits.
//! Specialized drivers start from a clone of a base declaration and
//! customize it. Properties are shared through `Arc`, a property is only
//! copied when a declaration customizes one it shares with another
//! declaration.

use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

use crate::alias;
use crate::composer::HookPoint;
use crate::customization::Change;
use crate::error::{Result, StructuralError};
use crate::limits::LimitsValidator;
use crate::node::Node;
use crate::property::{Property, PropertyConfig};
use crate::value::{ChannelId, Value};

/// Provider of named limits, usually querying the device.
pub type LimitsFn = Arc<dyn Fn(&dyn Node) -> Result<LimitsValidator> + Send + Sync>;

/// Lists the channel ids currently valid on the parent node.
pub type ListFn = Arc<dyn Fn(&dyn Node) -> Result<Vec<ChannelId>> + Send + Sync>;

/// Declaration of a node type.
#[derive(Clone, Default)]
pub struct NodeDecl {
    doc: Option<String>,
    properties: IndexMap<String, Arc<Property>>,
    subsystems: IndexMap<String, Arc<NodeDecl>>,
    channels: IndexMap<String, Arc<ChannelDecl>>,
    limits: IndexMap<String, LimitsFn>,
}

impl NodeDecl {
    /// Empty declaration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a documentation string.
    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// Documentation string.
    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    // -------------------------------------------------------------------------
    // Properties
    // -------------------------------------------------------------------------

    /// Add (or redefine) a property, assigning its name.
    pub fn add_property(&mut self, name: &str, mut property: Property) -> &mut Self {
        property.set_name(name);
        self.properties.insert(name.to_string(), Arc::new(property));
        self
    }

    /// Build a property from `config` and add it.
    pub fn declare(&mut self, name: &str, config: PropertyConfig) -> Result<&mut Self> {
        let property = Property::new(config)?;
        Ok(self.add_property(name, property))
    }

    /// Add a property mirroring the one at `path`.
    pub fn add_alias(&mut self, name: &str, path: &str, settable: bool) -> Result<&mut Self> {
        let property = alias::alias(path, settable)?;
        Ok(self.add_property(name, property))
    }

    /// Declared property `name`.
    pub fn property(&self, name: &str) -> Result<Arc<Property>> {
        self.properties
            .get(name)
            .cloned()
            .ok_or_else(|| StructuralError::UnknownProperty(name.to_string()).into())
    }

    /// Properties in declaration order.
    pub fn properties(&self) -> impl Iterator<Item = (&str, &Arc<Property>)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Property names in declaration order.
    pub fn property_names(&self) -> Vec<String> {
        self.properties.keys().cloned().collect()
    }

    /// Change the construction arguments of a declared property.
    ///
    /// The property is rebuilt from the edited config and its customizations
    /// are replayed onto the new instance.
    pub fn set_property<F>(&mut self, name: &str, edit: F) -> Result<()>
    where
        F: FnOnce(&mut PropertyConfig),
    {
        let current = self.property(name)?;
        let mut config = current.config().clone();
        edit(&mut config);
        let derived = current.derive(config)?;
        self.properties.insert(name.to_string(), Arc::new(derived));
        Ok(())
    }

    fn property_mut(&mut self, name: &str) -> Result<&mut Property> {
        let property = self
            .properties
            .get_mut(name)
            .ok_or_else(|| StructuralError::UnknownProperty(name.to_string()))?;
        Ok(Arc::make_mut(property))
    }

    /// Customize a pipeline of property `name`.
    pub fn customize(&mut self, name: &str, hook: HookPoint, change: Change) -> Result<()> {
        self.property_mut(name)?.modify_behavior(hook, change)
    }

    /// Replace the device read step of property `name`.
    pub fn override_read<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: Fn(&Property, &dyn Node) -> Result<Value> + Send + Sync + 'static,
    {
        self.property_mut(name)?.override_read(f);
        Ok(())
    }

    /// Replace the device write step of property `name`.
    pub fn override_write<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: Fn(&Property, &dyn Node, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.property_mut(name)?.override_write(f);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Children
    // -------------------------------------------------------------------------

    /// Declare a subsystem, replacing any previous one with that name.
    pub fn add_subsystem(&mut self, name: &str, decl: NodeDecl) -> &mut Self {
        self.subsystems.insert(name.to_string(), Arc::new(decl));
        self
    }

    /// Mutable access to a subsystem declaration, cloned if shared.
    pub fn subsystem_mut(&mut self, name: &str) -> Result<&mut NodeDecl> {
        let decl = self
            .subsystems
            .get_mut(name)
            .ok_or_else(|| StructuralError::UnknownSubsystem(name.to_string()))?;
        Ok(Arc::make_mut(decl))
    }

    /// Declared subsystems.
    pub fn subsystems(&self) -> impl Iterator<Item = (&str, &Arc<NodeDecl>)> {
        self.subsystems.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Declare a channel container. The declaration must say how to list
    /// the available ids.
    pub fn add_channel(&mut self, name: &str, decl: ChannelDecl) -> Result<&mut Self> {
        if decl.available.is_none() {
            return Err(StructuralError::MissingChannelEnumeration(name.to_string()).into());
        }
        self.channels.insert(name.to_string(), Arc::new(decl));
        Ok(self)
    }

    /// Mutable access to a channel declaration, cloned if shared.
    pub fn channel_mut(&mut self, name: &str) -> Result<&mut ChannelDecl> {
        let decl = self
            .channels
            .get_mut(name)
            .ok_or_else(|| StructuralError::UnknownChannel(name.to_string()))?;
        Ok(Arc::make_mut(decl))
    }

    /// Declared channel containers.
    pub fn channels(&self) -> impl Iterator<Item = (&str, &Arc<ChannelDecl>)> {
        self.channels.iter().map(|(k, v)| (k.as_str(), v))
    }

    // -------------------------------------------------------------------------
    // Limits
    // -------------------------------------------------------------------------

    /// Declare named limits, fetched through `provider` on first use.
    pub fn add_limits<F>(&mut self, id: &str, provider: F) -> &mut Self
    where
        F: Fn(&dyn Node) -> Result<LimitsValidator> + Send + Sync + 'static,
    {
        self.limits.insert(id.to_string(), Arc::new(provider));
        self
    }

    /// Provider of the named limits `id`.
    pub fn limits_provider(&self, id: &str) -> Option<LimitsFn> {
        self.limits.get(id).cloned()
    }

    /// Ids of the declared named limits.
    pub fn limits_ids(&self) -> Vec<String> {
        self.limits.keys().cloned().collect()
    }
}

impl fmt::Debug for NodeDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDecl")
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .field("subsystems", &self.subsystems)
            .field("channels", &self.channels)
            .field("limits", &self.limits.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// How a channel container learns which ids exist.
#[derive(Clone)]
pub enum Availability {
    /// Fixed list
    Static(Vec<ChannelId>),
    /// Asked to the parent node at every listing
    Query(ListFn),
}

impl fmt::Debug for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Availability::Static(ids) => f.debug_tuple("Static").field(ids).finish(),
            Availability::Query(_) => write!(f, "Query(<function>)"),
        }
    }
}

/// Declaration of a channel container.
#[derive(Debug, Clone)]
pub struct ChannelDecl {
    node: Arc<NodeDecl>,
    pub(crate) available: Option<Availability>,
    pub(crate) aliases: IndexMap<ChannelId, ChannelId>,
}

impl ChannelDecl {
    /// Channels built from `node`. Ids must be provided with
    /// [`with_ids`](Self::with_ids) or [`with_query`](Self::with_query).
    pub fn new(node: NodeDecl) -> Self {
        Self {
            node: Arc::new(node),
            available: None,
            aliases: IndexMap::new(),
        }
    }

    /// Fixed list of valid ids.
    pub fn with_ids<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ChannelId>,
    {
        self.available = Some(Availability::Static(ids.into_iter().map(Into::into).collect()));
        self
    }

    /// Valid ids asked to the parent node on each enumeration.
    pub fn with_query<F>(mut self, list: F) -> Self
    where
        F: Fn(&dyn Node) -> Result<Vec<ChannelId>> + Send + Sync + 'static,
    {
        self.available = Some(Availability::Query(Arc::new(list)));
        self
    }

    /// Make `alias` resolve to the channel `canonical`.
    pub fn with_alias(mut self, alias: impl Into<ChannelId>, canonical: impl Into<ChannelId>) -> Self {
        self.aliases.insert(alias.into(), canonical.into());
        self
    }

    /// Declaration shared by every channel.
    pub fn node(&self) -> &Arc<NodeDecl> {
        &self.node
    }

    /// Mutable channel declaration, cloned if shared.
    pub fn node_mut(&mut self) -> &mut NodeDecl {
        Arc::make_mut(&mut self.node)
    }
}
