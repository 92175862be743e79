//! Root node talking to the device.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use crate::config::InstrumentOptions;
use crate::declaration::NodeDecl;
use crate::error::{Result, StructuralError};
use crate::node::{Node, NodeCore, RoutingArgs};
use crate::property::Property;
use crate::transport::Transport;
use crate::value::Value;

/// Placeholder receiving the internal value in setter commands.
pub const VALUE_PLACEHOLDER: &str = "value";

/// Top-level instrument.
///
/// Accessor tokens are command templates: routing arguments added by
/// channels are available as placeholders (`"CH{id}:VOLT?"`), setters also
/// get `{value}`.
pub struct Instrument {
    core: NodeCore,
    transport: Mutex<Box<dyn Transport>>,
    options: InstrumentOptions,
}

impl Instrument {
    /// Instantiate `decl` as the root of a node tree talking over `transport`.
    pub fn new<T>(decl: impl Into<Arc<NodeDecl>>, transport: T, options: InstrumentOptions) -> Arc<Self>
    where
        T: Transport + 'static,
    {
        let decl = decl.into();
        Arc::new_cyclic(|this: &Weak<Instrument>| {
            let this: Weak<dyn Node> = this.clone();
            Instrument {
                core: NodeCore::new_root(decl, this, options.use_cache),
                transport: Mutex::new(Box::new(transport) as Box<dyn Transport>),
                options,
            }
        })
    }

    /// Options the instrument was created with.
    pub fn options(&self) -> &InstrumentOptions {
        &self.options
    }

    fn format(token: &str, routing: &RoutingArgs, value: Option<&Value>) -> Result<String> {
        if !token.contains('{') {
            return Ok(token.to_string());
        }
        let mut vars: HashMap<String, String> = routing
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect();
        if let Some(value) = value {
            vars.insert(VALUE_PLACEHOLDER.to_string(), value.to_string());
        }
        strfmt::strfmt(token, &vars).map_err(|e| {
            StructuralError::InvalidCommand {
                token: token.to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }
}

impl Node for Instrument {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn as_node(&self) -> &dyn Node {
        self
    }

    fn parent(&self) -> Option<Arc<dyn Node>> {
        None
    }

    fn resolve_read(&self, property: &Property, token: &str, routing: RoutingArgs) -> Result<Value> {
        let command = Self::format(token, &routing, None)?;
        debug!(property = property.name(), %command, "Query");
        let answer = self.transport.lock().query(&command)?;
        Ok(Value::Str(answer))
    }

    fn resolve_write(
        &self,
        property: &Property,
        token: &str,
        value: &Value,
        routing: RoutingArgs,
    ) -> Result<Value> {
        let command = Self::format(token, &routing, Some(value))?;
        debug!(property = property.name(), %command, "Write");
        let response = self.transport.lock().write(&command)?;
        Ok(Value::Str(response))
    }

    /// A write fails when its response carries one of the configured error
    /// codes.
    fn resolve_check(
        &self,
        property: &Property,
        _value: &Value,
        _internal: &Value,
        response: &Value,
        _routing: RoutingArgs,
    ) -> Result<(bool, Option<String>)> {
        let response = response.to_string();
        for (code, description) in &self.options.error_codes {
            if response.contains(code.as_str()) {
                debug!(property = property.name(), code = code.as_str(), "Device reported an error");
                return Ok((false, Some(format!("{} {}", code, description))));
            }
        }
        Ok((true, None))
    }

    fn reopen_connection(&self) -> Result<()> {
        info!("Reopening instrument connection");
        self.transport.lock().reopen()?;
        Ok(())
    }
}

impl std::fmt::Debug for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrument")
            .field("core", &self.core)
            .field("options", &self.options)
            .finish()
    }
}
