//! Driver configuration.
//!
//! Drivers can be declared in code with [`NodeDecl`] or described in TOML:
//!
//! ```toml
//! [instrument]
//! use_cache = true
//! error_codes = { "E13" = "Overload" }
//!
//! [properties.voltage]
//! getter = "VOLT?"
//! setter = "VOLT {value}"
//! kind = "float"
//! retries = 2
//! limits = { minimum = 0, maximum = 10 }
//!
//! [subsystems.output.properties.enabled]
//! getter = "OUTP?"
//! kind = "bool"
//!
//! [channels.ch]
//! ids = [1, 2]
//! id_aliases = { "main" = 1 }
//!
//! [channels.ch.properties.current]
//! getter = "CH{id}:CURR?"
//! ```
//!
//! # Loading Strategy
//!
//! [`DriverConfig::load`] layers three sources, later ones winning:
//!
//! 1. Serialized defaults
//! 2. The TOML file
//! 3. Environment variables prefixed with `DAQ_PROPS_`, `__` separating
//!    nested keys (`DAQ_PROPS_INSTRUMENT__USE_CACHE=false`)

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::declaration::{ChannelDecl, NodeDecl};
use crate::instrument::Instrument;
use crate::limits::LimitsValidator;
use crate::property::PropertyConfig;
use crate::transport::Transport;
use crate::value::ChannelId;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DAQ_PROPS_";

/// Behavior of a root node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentOptions {
    /// Cache policy of the whole node tree
    pub use_cache: bool,
    /// Error codes the device may put in a write response, with their meaning
    pub error_codes: IndexMap<String, String>,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            error_codes: IndexMap::new(),
        }
    }
}

/// Property that mirrors another one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasConfig {
    /// Path of the mirrored property, `.` prefixes climb to parents
    pub path: String,
    /// Whether writes go through to the target
    #[serde(default)]
    pub settable: bool,
}

/// Declaration of one node in configuration form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Documentation string
    pub doc: Option<String>,
    /// Property declarations
    pub properties: IndexMap<String, PropertyConfig>,
    /// Alias properties
    pub aliases: IndexMap<String, AliasConfig>,
    /// Named limits with fixed values
    pub limits: IndexMap<String, LimitsValidator>,
    /// Subsystems keyed by their name
    pub subsystems: IndexMap<String, NodeConfig>,
    /// Channel containers keyed by their name
    pub channels: IndexMap<String, ChannelConfig>,
}

/// Channel container in configuration form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Canonical channel ids
    pub ids: Vec<ChannelId>,
    /// Alternative ids resolving to a canonical one. Property aliases of the
    /// channel node live in the flattened `aliases` table.
    pub id_aliases: IndexMap<String, ChannelId>,
    /// Declaration shared by every channel
    #[serde(flatten)]
    pub node: NodeConfig,
}

/// Complete driver description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Root node behavior
    pub instrument: InstrumentOptions,
    /// Declaration of the root node
    #[serde(flatten)]
    pub node: NodeConfig,
}

impl DriverConfig {
    /// Load from a TOML file with environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config: DriverConfig = Self::layered(Toml::file(path))
            .extract()
            .with_context(|| format!("Failed to load driver configuration from {}", path.display()))?;
        info!(
            path = %path.display(),
            properties = config.node.properties.len(),
            "Loaded driver configuration"
        );
        Ok(config)
    }

    /// Parse TOML text, with environment overrides.
    pub fn from_toml(text: &str) -> Result<Self> {
        Self::layered(Toml::string(text))
            .extract()
            .context("Failed to parse driver configuration")
    }

    fn layered(toml: figment::providers::Data<Toml>) -> Figment {
        Figment::from(Serialized::defaults(DriverConfig::default()))
            .merge(toml)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Build the declaration described by this configuration.
    pub fn declaration(&self) -> crate::error::Result<NodeDecl> {
        self.node.declaration()
    }

    /// Declare and instantiate the driver on `transport`.
    pub fn connect<T>(&self, transport: T) -> crate::error::Result<Arc<Instrument>>
    where
        T: Transport + 'static,
    {
        Ok(Instrument::new(self.declaration()?, transport, self.instrument.clone()))
    }
}

impl NodeConfig {
    /// Build the declaration of this node and its children.
    pub fn declaration(&self) -> crate::error::Result<NodeDecl> {
        let mut decl = NodeDecl::new();
        if let Some(doc) = &self.doc {
            decl = decl.with_doc(doc.clone());
        }
        for (name, config) in &self.properties {
            decl.declare(name, config.clone())?;
        }
        for (name, alias) in &self.aliases {
            decl.add_alias(name, &alias.path, alias.settable)?;
        }
        for (id, limits) in &self.limits {
            let limits = limits.clone();
            decl.add_limits(id, move |_| Ok(limits.clone()));
        }
        for (name, sub) in &self.subsystems {
            decl.add_subsystem(name, sub.declaration()?);
        }
        for (name, channel) in &self.channels {
            let mut ch = ChannelDecl::new(channel.node.declaration()?);
            if !channel.ids.is_empty() {
                ch = ch.with_ids(channel.ids.iter().cloned());
            }
            for (alias, canonical) in &channel.id_aliases {
                ch = ch.with_alias(alias.as_str(), canonical.clone());
            }
            decl.add_channel(name, ch)?;
        }
        Ok(decl)
    }
}
