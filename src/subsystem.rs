//! Subsystem relay node.

use std::sync::{Arc, Weak};

use crate::declaration::NodeDecl;
use crate::error::{Result, StructuralError};
use crate::node::{Node, NodeCore, RoutingArgs, SharedLock};
use crate::property::Property;
use crate::value::Value;

/// Named group of properties inside a node.
///
/// A subsystem has its own cache but forwards every device operation to its
/// parent unchanged, and shares the parent's lock.
pub struct Subsystem {
    name: String,
    core: NodeCore,
    parent: Weak<dyn Node>,
}

impl Subsystem {
    pub(crate) fn new(
        name: &str,
        decl: Arc<NodeDecl>,
        parent: Weak<dyn Node>,
        lock: SharedLock,
        use_cache: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Subsystem>| {
            let this: Weak<dyn Node> = this.clone();
            Subsystem {
                name: name.to_string(),
                core: NodeCore::new(decl, this, lock, use_cache),
                parent,
            }
        })
    }

    /// Name on the parent node.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn attached(&self) -> Result<Arc<dyn Node>> {
        self.parent
            .upgrade()
            .ok_or_else(|| StructuralError::DetachedNode.into())
    }
}

impl Node for Subsystem {
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
        self.attached()?.resolve_read(property, token, routing)
    }

    fn resolve_write(
        &self,
        property: &Property,
        token: &str,
        value: &Value,
        routing: RoutingArgs,
    ) -> Result<Value> {
        self.attached()?.resolve_write(property, token, value, routing)
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
            .resolve_check(property, value, internal, response, routing)
    }

    fn reopen_connection(&self) -> Result<()> {
        self.attached()?.reopen_connection()
    }
}

impl std::fmt::Debug for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subsystem")
            .field("name", &self.name)
            .field("core", &self.core)
            .finish()
    }
}
