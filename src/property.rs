//! Declarative instrument properties.
//!
//! A [`Property`] describes one device-exposed value: how to read it, how to
//! write it and what to check around both operations. It owns four
//! [`Composer`]s, one per [`HookPoint`], and runs the read and write chains
//! against the [`Node`] it is accessed through:
//!
//! ```text
//! read:  cache? -> pre_read -> fetch (retry + reopen) -> post_read -> cache
//! write: cache == value? -> pre_write -> send (retry + reopen) -> post_write -> cache
//! ```
//!
//! Built-in stages are installed from the [`PropertyConfig`] and are not part
//! of the customization log:
//!
//! | Hook       | Stage       | Installed when        |
//! |------------|-------------|-----------------------|
//! | pre_read   | `checks`    | read checks given     |
//! | post_read  | `extract`   | `get_format` given    |
//! | post_read  | `cast`      | `kind` given          |
//! | pre_write  | `checks`    | write checks given    |
//! | pre_write  | `validate`  | `limits` given        |
//! | post_write | `operation` | always                |
//! | post_write | `discard`   | `discard` not empty   |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::check::{CheckDirection, CheckExpr};
use crate::composer::{Composer, HookPoint, ReadFn, Stage, WriteFn, WriteOutcome};
use crate::customization::{self, Change, CustomLog};
use crate::error::{PropertyError, Result};
use crate::format::ExtractFormat;
use crate::limits::LimitsSource;
use crate::node::{Node, NodeExt, RoutingArgs};
use crate::value::{Value, ValueKind};

/// Name of the built-in check stages.
pub const CHECKS_STAGE: &str = "checks";
/// Name of the built-in operation check stage.
pub const OPERATION_STAGE: &str = "operation";
/// Name of the built-in cache discard stage.
pub const DISCARD_STAGE: &str = "discard";
/// Name of the built-in extraction stage.
pub const EXTRACT_STAGE: &str = "extract";
/// Name of the built-in cast stage.
pub const CAST_STAGE: &str = "cast";
/// Name of the built-in limits validation stage.
pub const VALIDATE_STAGE: &str = "validate";

// =============================================================================
// Configuration
// =============================================================================

/// Boolean checks run before reading and/or writing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Checks {
    /// Same clauses for both directions
    Both(String),
    Split {
        #[serde(default)]
        read: Option<String>,
        #[serde(default)]
        write: Option<String>,
    },
}

impl Checks {
    fn read(&self) -> Option<&str> {
        match self {
            Checks::Both(s) => Some(s),
            Checks::Split { read, .. } => read.as_deref(),
        }
    }

    fn write(&self) -> Option<&str> {
        match self {
            Checks::Both(s) => Some(s),
            Checks::Split { write, .. } => write.as_deref(),
        }
    }
}

/// Construction arguments of a property.
///
/// Changing them on an existing declaration derives a new property, see
/// [`Property::derive`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyConfig {
    /// Command used to query the value, `None` makes the property write-only
    pub getter: Option<String>,
    /// Command used to set the value, `None` makes the property read-only.
    /// `{value}` is replaced by the internal value.
    pub setter: Option<String>,
    /// Shape of the device answer, see [`ExtractFormat`]
    pub get_format: Option<String>,
    /// Attempts made after a recoverable communication failure
    pub retries: u32,
    /// Assertions evaluated before device access
    pub checks: Option<Checks>,
    /// Paths of properties whose cached value is dropped after a write
    pub discard: Vec<String>,
    /// Bounds enforced on written values
    pub limits: Option<LimitsSource>,
    /// Type the device answer is converted to
    pub kind: Option<ValueKind>,
    /// Participate in the node cache
    pub caching: bool,
    /// Documentation string
    pub doc: Option<String>,
}

impl Default for PropertyConfig {
    fn default() -> Self {
        Self {
            getter: None,
            setter: None,
            get_format: None,
            retries: 0,
            checks: None,
            discard: Vec::new(),
            limits: None,
            kind: None,
            caching: true,
            doc: None,
        }
    }
}

impl PropertyConfig {
    /// Config with no accessor and caching on.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the property readable through `getter`.
    pub fn with_getter(mut self, getter: impl Into<String>) -> Self {
        self.getter = Some(getter.into());
        self
    }

    /// Make the property writable through `setter`.
    pub fn with_setter(mut self, setter: impl Into<String>) -> Self {
        self.setter = Some(setter.into());
        self
    }

    /// Extract the value from answers matching `format`.
    pub fn with_get_format(mut self, format: impl Into<String>) -> Self {
        self.get_format = Some(format.into());
        self
    }

    /// Attempts allowed after a recoverable communication failure.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Checks run before both reads and writes.
    pub fn with_checks(mut self, checks: impl Into<String>) -> Self {
        self.checks = Some(Checks::Both(checks.into()));
        self
    }

    /// Separate read and write checks.
    pub fn with_split_checks(mut self, read: Option<&str>, write: Option<&str>) -> Self {
        self.checks = Some(Checks::Split {
            read: read.map(String::from),
            write: write.map(String::from),
        });
        self
    }

    /// Cached values invalidated after each write.
    pub fn with_discard<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.discard = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Validate written values against `limits`.
    pub fn with_limits(mut self, limits: impl Into<LimitsSource>) -> Self {
        self.limits = Some(limits.into());
        self
    }

    /// Cast read values to `kind`.
    pub fn with_kind(mut self, kind: ValueKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Enable or disable caching of the value.
    pub fn with_caching(mut self, caching: bool) -> Self {
        self.caching = caching;
        self
    }

    /// Attach a documentation string.
    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }
}

// =============================================================================
// Property
// =============================================================================

/// One declared device-exposed value.
#[derive(Clone)]
pub struct Property {
    name: String,
    config: PropertyConfig,
    pre_read: Composer,
    post_read: Composer,
    pre_write: Composer,
    post_write: Composer,
    read_override: Option<ReadFn>,
    write_override: Option<WriteFn>,
    pub(crate) customs: CustomLog,
}

impl Property {
    /// Build a property and install its built-in stages.
    ///
    /// The name is assigned when the property is added to a
    /// [`NodeDecl`](crate::declaration::NodeDecl).
    pub fn new(config: PropertyConfig) -> Result<Self> {
        let mut property = Self {
            name: String::new(),
            config: config.clone(),
            pre_read: Composer::new(HookPoint::PreRead),
            post_read: Composer::new(HookPoint::PostRead),
            pre_write: Composer::new(HookPoint::PreWrite),
            post_write: Composer::new(HookPoint::PostWrite),
            read_override: None,
            write_override: None,
            customs: CustomLog::default(),
        };

        property.modify_behavior_internal(
            HookPoint::PostWrite,
            Change::prepend(OPERATION_STAGE, Stage::post_write(check_operation)),
        )?;

        if let Some(checks) = &config.checks {
            if let Some(source) = checks.read() {
                let check = CheckExpr::compile(source, CheckDirection::Read)?;
                if !check.is_empty() {
                    let stage = Stage::pre_read(move |p, node| check.evaluate(p.name(), node, None));
                    property.modify_behavior_internal(HookPoint::PreRead, Change::prepend(CHECKS_STAGE, stage))?;
                }
            }
            if let Some(source) = checks.write() {
                let check = CheckExpr::compile(source, CheckDirection::Write)?;
                if !check.is_empty() {
                    let stage = Stage::pre_write(move |p, node, value| {
                        check.evaluate(p.name(), node, Some(&value))?;
                        Ok(value)
                    });
                    property.modify_behavior_internal(HookPoint::PreWrite, Change::prepend(CHECKS_STAGE, stage))?;
                }
            }
        }

        if !config.discard.is_empty() {
            let stage = Stage::post_write(|p, node, _| node.discard_cached(&p.config.discard));
            property.modify_behavior_internal(HookPoint::PostWrite, Change::append(DISCARD_STAGE, stage))?;
        }

        if let Some(format) = &config.get_format {
            let format = ExtractFormat::compile(format)?;
            let stage = Stage::post_read(move |p, _, value| format.extract(p.name(), &value));
            property.modify_behavior_internal(HookPoint::PostRead, Change::prepend(EXTRACT_STAGE, stage))?;
        }

        if let Some(kind) = config.kind {
            let stage = Stage::post_read(move |p, _, value| {
                kind.cast(&value).map_err(|message| {
                    PropertyError::validation(p.name(), format!("Getting {}: {}", p.name(), message))
                })
            });
            property.modify_behavior_internal(HookPoint::PostRead, Change::append(CAST_STAGE, stage))?;
        }

        if let Some(limits) = &config.limits {
            let limits = limits.clone();
            let stage = Stage::pre_write(move |p, node, value| validate_limits(p, node, &limits, value));
            property.modify_behavior_internal(HookPoint::PreWrite, Change::append(VALIDATE_STAGE, stage))?;
        }

        Ok(property)
    }

    /// Name under which the property is declared.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// Documentation string.
    pub fn doc(&self) -> Option<&str> {
        self.config.doc.as_deref()
    }

    /// Construction arguments.
    pub fn config(&self) -> &PropertyConfig {
        &self.config
    }

    /// Retry budget.
    pub fn retries(&self) -> u32 {
        self.config.retries
    }

    /// Whether a getter or read override exists.
    pub fn is_readable(&self) -> bool {
        self.config.getter.is_some() || self.read_override.is_some()
    }

    /// Whether a setter or write override exists.
    pub fn is_writable(&self) -> bool {
        self.config.setter.is_some() || self.write_override.is_some()
    }

    /// User customizations applied so far.
    pub fn customs(&self) -> &CustomLog {
        &self.customs
    }

    /// Stages run at `hook`.
    pub fn composer(&self, hook: HookPoint) -> &Composer {
        match hook {
            HookPoint::PreRead => &self.pre_read,
            HookPoint::PostRead => &self.post_read,
            HookPoint::PreWrite => &self.pre_write,
            HookPoint::PostWrite => &self.post_write,
        }
    }

    fn composer_mut(&mut self, hook: HookPoint) -> &mut Composer {
        match hook {
            HookPoint::PreRead => &mut self.pre_read,
            HookPoint::PostRead => &mut self.post_read,
            HookPoint::PreWrite => &mut self.pre_write,
            HookPoint::PostWrite => &mut self.post_write,
        }
    }

    // -------------------------------------------------------------------------
    // Customization
    // -------------------------------------------------------------------------

    /// Apply `change` to the composer of `hook` and log it for replay.
    pub fn modify_behavior(&mut self, hook: HookPoint, change: Change) -> Result<()> {
        change.apply(self.composer_mut(hook))?;
        self.customs.record(hook, &change);
        Ok(())
    }

    /// Apply `change` without logging it (built-in behavior).
    pub(crate) fn modify_behavior_internal(&mut self, hook: HookPoint, change: Change) -> Result<()> {
        change.apply(self.composer_mut(hook))
    }

    /// Replace the device read step.
    pub fn override_read<F>(&mut self, f: F)
    where
        F: Fn(&Property, &dyn Node) -> Result<Value> + Send + Sync + 'static,
    {
        self.override_read_with(Arc::new(f));
    }

    /// Replace the device query with `f`.
    pub fn override_read_with(&mut self, f: ReadFn) {
        self.customs.read = Some(f.clone());
        self.read_override = Some(f);
    }

    /// Replace the device write step. The callable returns the device response.
    pub fn override_write<F>(&mut self, f: F)
    where
        F: Fn(&Property, &dyn Node, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.override_write_with(Arc::new(f));
    }

    /// Replace the device command with `f`.
    pub fn override_write_with(&mut self, f: WriteFn) {
        self.customs.write = Some(f.clone());
        self.write_override = Some(f);
    }

    pub(crate) fn set_accessors(&mut self, read: Option<ReadFn>, write: Option<WriteFn>) {
        self.read_override = read;
        self.write_override = write;
    }

    /// Replay the customizations of `source` onto this property.
    pub fn copy_custom_behaviors(&mut self, source: &Property) -> Result<()> {
        customization::replay(self, source)
    }

    /// Build a property from new construction arguments, keeping the name
    /// and replaying the customizations of `self`.
    pub fn derive(&self, config: PropertyConfig) -> Result<Property> {
        let mut derived = Property::new(config)?;
        derived.name = self.name.clone();
        derived.copy_custom_behaviors(self)?;
        Ok(derived)
    }

    // -------------------------------------------------------------------------
    // Chains
    // -------------------------------------------------------------------------

    fn uses_cache(&self, node: &dyn Node) -> bool {
        self.config.caching && node.use_cache()
    }

    /// Read the value through `node`, answering from its cache when possible.
    pub fn read(&self, node: &dyn Node) -> Result<Value> {
        if !self.is_readable() {
            return Err(PropertyError::NotReadable(self.name.clone()));
        }

        let _guard = node.lock().lock();
        let use_cache = self.uses_cache(node);
        if use_cache {
            if let Some(value) = node.cache().get(&self.name) {
                trace!(property = %self.name, %value, "Cache hit");
                return Ok(value);
            }
        }

        let value = self.read_chain(node)?;
        if use_cache {
            node.cache().insert(&self.name, value.clone());
        }
        Ok(value)
    }

    /// Write `value` through `node`. Writing the cached value is a no-op.
    pub fn write(&self, node: &dyn Node, value: Value) -> Result<()> {
        if !self.is_writable() {
            return Err(PropertyError::NotWritable(self.name.clone()));
        }

        let _guard = node.lock().lock();
        let use_cache = self.uses_cache(node);
        if use_cache && node.cache().get(&self.name).as_ref() == Some(&value) {
            debug!(property = %self.name, %value, "Value already set, skipping write");
            return Ok(());
        }

        self.write_chain(node, value.clone())?;
        if use_cache {
            node.cache().insert(&self.name, value);
        }
        Ok(())
    }

    /// Drop the cached value of this property.
    pub fn discard(&self, node: &dyn Node) {
        let _guard = node.lock().lock();
        node.cache().remove(&self.name);
    }

    fn read_chain(&self, node: &dyn Node) -> Result<Value> {
        self.pre_read.run_pre_read(self, node)?;
        let raw = self.with_retries(node, || self.fetch(node))?;
        self.post_read.run_transform(self, node, raw)
    }

    fn write_chain(&self, node: &dyn Node, value: Value) -> Result<()> {
        let internal = self.pre_write.run_transform(self, node, value.clone())?;
        let response = self.with_retries(node, || self.send(node, &internal))?;
        let outcome = WriteOutcome {
            value,
            internal,
            response,
        };
        self.post_write.run_post_write(self, node, &outcome)
    }

    fn fetch(&self, node: &dyn Node) -> Result<Value> {
        if let Some(read) = &self.read_override {
            return read(self, node);
        }
        match &self.config.getter {
            Some(getter) => node.resolve_read(self, getter, RoutingArgs::new()),
            None => Err(PropertyError::NotReadable(self.name.clone())),
        }
    }

    fn send(&self, node: &dyn Node, internal: &Value) -> Result<Value> {
        if let Some(write) = &self.write_override {
            return write(self, node, internal);
        }
        match &self.config.setter {
            Some(setter) => node.resolve_write(self, setter, internal, RoutingArgs::new()),
            None => Err(PropertyError::NotWritable(self.name.clone())),
        }
    }

    /// Run `attempt`, reopening the connection after each recoverable
    /// failure until the retry budget is spent.
    fn with_retries<T>(&self, node: &dyn Node, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
        let mut failures = 0;
        loop {
            match attempt() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() && failures < self.config.retries => {
                    failures += 1;
                    warn!(
                        property = %self.name,
                        attempt = failures,
                        retries = self.config.retries,
                        error = %err,
                        "Communication failed, reopening connection"
                    );
                    node.reopen_connection()?;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("pre_read", &self.pre_read)
            .field("post_read", &self.post_read)
            .field("pre_write", &self.pre_write)
            .field("post_write", &self.post_write)
            .field("read_override", &self.read_override.is_some())
            .field("write_override", &self.write_override.is_some())
            .finish()
    }
}

/// Default post-write stage: ask the node whether the device applied the write.
fn check_operation(property: &Property, node: &dyn Node, outcome: &WriteOutcome) -> Result<()> {
    let (ok, details) = node.resolve_check(
        property,
        &outcome.value,
        &outcome.internal,
        &outcome.response,
        RoutingArgs::new(),
    )?;
    if ok {
        return Ok(());
    }
    Err(PropertyError::OperationCheck {
        property: property.name().to_string(),
        value: outcome.value.clone(),
        internal: outcome.internal.clone(),
        details,
    })
}

fn validate_limits(property: &Property, node: &dyn Node, source: &LimitsSource, value: Value) -> Result<Value> {
    let limits = match source {
        LimitsSource::Static(limits) => limits.clone(),
        LimitsSource::Named(id) => node.get_limits(id)?,
    };
    if limits.validate(&value) {
        return Ok(value);
    }
    Err(PropertyError::OutOfRange {
        property: property.name().to_string(),
        value,
        minimum: limits.minimum,
        maximum: limits.maximum,
        step: limits.step,
    })
}
