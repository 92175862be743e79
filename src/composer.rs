//! Pipeline composer.
//!
//! Every property owns one [`Composer`] per [`HookPoint`]. A composer is an
//! ordered list of uniquely named [`Stage`]s; stages are always invoked in
//! the current sequence order.
//!
//! - pre-read and post-write stages run for their side effects (checks,
//!   cache invalidation), the first error aborts the chain
//! - post-read and pre-write stages form a value-transform chain, each stage
//!   receives the previous stage's output

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, StructuralError};
use crate::node::Node;
use crate::property::Property;
use crate::value::Value;

// =============================================================================
// Hook points and stages
// =============================================================================

/// Point of a read or write chain where stages can be attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    /// Before the device is queried
    PreRead,
    /// Transforms the raw answer into the returned value
    PostRead,
    /// Transforms the user value into the sent value
    PreWrite,
    /// After the device accepted the command
    PostWrite,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HookPoint::PreRead => "pre_read",
            HookPoint::PostRead => "post_read",
            HookPoint::PreWrite => "pre_write",
            HookPoint::PostWrite => "post_write",
        };
        write!(f, "{}", label)
    }
}

/// Side-effect stage run before the device read.
pub type PreReadFn = Arc<dyn Fn(&Property, &dyn Node) -> Result<()> + Send + Sync>;

/// Value-transform stage (post-read and pre-write).
pub type TransformFn = Arc<dyn Fn(&Property, &dyn Node, Value) -> Result<Value> + Send + Sync>;

/// Side-effect stage run after a successful device write.
pub type PostWriteFn = Arc<dyn Fn(&Property, &dyn Node, &WriteOutcome) -> Result<()> + Send + Sync>;

/// Replacement for the device read step of a property.
pub type ReadFn = Arc<dyn Fn(&Property, &dyn Node) -> Result<Value> + Send + Sync>;

/// Replacement for the device write step, returns the device response.
pub type WriteFn = Arc<dyn Fn(&Property, &dyn Node, &Value) -> Result<Value> + Send + Sync>;

/// What post-write stages know about the write that just happened.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// Value requested by the caller
    pub value: Value,
    /// Value after the pre-write chain, as sent to the device
    pub internal: Value,
    /// Device answer to the write
    pub response: Value,
}

/// One unit of behavior attached at a hook point.
///
/// The callable receives the property it runs for, so a stage stays valid
/// when the property is cloned or re-derived.
#[derive(Clone)]
pub enum Stage {
    /// Runs before the query
    PreRead(PreReadFn),
    /// Maps the read value
    PostRead(TransformFn),
    /// Maps the value to send
    PreWrite(TransformFn),
    /// Sees the outcome of the write
    PostWrite(PostWriteFn),
}

impl Stage {
    /// Side effect run before a read.
    pub fn pre_read<F>(f: F) -> Self
    where
        F: Fn(&Property, &dyn Node) -> Result<()> + Send + Sync + 'static,
    {
        Stage::PreRead(Arc::new(f))
    }

    /// Transform of the value read from the device.
    pub fn post_read<F>(f: F) -> Self
    where
        F: Fn(&Property, &dyn Node, Value) -> Result<Value> + Send + Sync + 'static,
    {
        Stage::PostRead(Arc::new(f))
    }

    /// Transform of the value about to be sent.
    pub fn pre_write<F>(f: F) -> Self
    where
        F: Fn(&Property, &dyn Node, Value) -> Result<Value> + Send + Sync + 'static,
    {
        Stage::PreWrite(Arc::new(f))
    }

    /// Side effect run once a write went through.
    pub fn post_write<F>(f: F) -> Self
    where
        F: Fn(&Property, &dyn Node, &WriteOutcome) -> Result<()> + Send + Sync + 'static,
    {
        Stage::PostWrite(Arc::new(f))
    }

    /// Hook point this stage can be attached to.
    pub fn hook(&self) -> HookPoint {
        match self {
            Stage::PreRead(_) => HookPoint::PreRead,
            Stage::PostRead(_) => HookPoint::PostRead,
            Stage::PreWrite(_) => HookPoint::PreWrite,
            Stage::PostWrite(_) => HookPoint::PostWrite,
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stage::{}(<function>)", self.hook())
    }
}

// =============================================================================
// Composer
// =============================================================================

/// Ordered, named stages for one hook point.
#[derive(Clone)]
pub struct Composer {
    hook: HookPoint,
    stages: Vec<(String, Stage)>,
}

impl Composer {
    /// Empty composer accepting stages for `hook` only.
    pub fn new(hook: HookPoint) -> Self {
        Self {
            hook,
            stages: Vec::new(),
        }
    }

    /// Hook point the stages belong to.
    pub fn hook(&self) -> HookPoint {
        self.hook
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether no stage is installed.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in invocation order.
    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Whether a stage called `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Index of the stage called `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|(n, _)| n == name)
    }

    /// Stage called `name`.
    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    /// Insert `stage` first.
    pub fn prepend(&mut self, name: &str, stage: Stage) -> Result<()> {
        self.insert(0, name, stage)
    }

    /// Insert `stage` last.
    pub fn append(&mut self, name: &str, stage: Stage) -> Result<()> {
        self.insert(self.stages.len(), name, stage)
    }

    /// Insert `stage` right before `anchor`.
    pub fn add_before(&mut self, anchor: &str, name: &str, stage: Stage) -> Result<()> {
        let index = self.require(anchor)?;
        self.insert(index, name, stage)
    }

    /// Insert `stage` right after `anchor`.
    pub fn add_after(&mut self, anchor: &str, name: &str, stage: Stage) -> Result<()> {
        let index = self.require(anchor)?;
        self.insert(index + 1, name, stage)
    }

    /// Swap the callable of an existing stage, keeping its position.
    pub fn replace(&mut self, name: &str, stage: Stage) -> Result<()> {
        self.check_hook(&stage)?;
        let index = self.require(name)?;
        self.stages[index].1 = stage;
        Ok(())
    }

    /// Remove the stage called `name` and return it.
    pub fn remove(&mut self, name: &str) -> Result<Stage> {
        let index = self.require(name)?;
        Ok(self.stages.remove(index).1)
    }

    /// Drop every stage.
    pub fn reset(&mut self) {
        self.stages.clear();
    }

    fn insert(&mut self, index: usize, name: &str, stage: Stage) -> Result<()> {
        self.check_hook(&stage)?;
        if self.contains(name) {
            return Err(StructuralError::DuplicateStage {
                hook: self.hook,
                name: name.to_string(),
            }
            .into());
        }
        self.stages.insert(index, (name.to_string(), stage));
        Ok(())
    }

    fn require(&self, name: &str) -> Result<usize> {
        self.position(name).ok_or_else(|| {
            StructuralError::StageNotFound {
                hook: self.hook,
                name: name.to_string(),
            }
            .into()
        })
    }

    fn check_hook(&self, stage: &Stage) -> Result<()> {
        if stage.hook() != self.hook {
            return Err(StructuralError::StageHookMismatch {
                hook: self.hook,
                stage: stage.hook(),
            }
            .into());
        }
        Ok(())
    }

    /// Run pre-read stages in order.
    pub fn run_pre_read(&self, property: &Property, node: &dyn Node) -> Result<()> {
        for (_, stage) in &self.stages {
            if let Stage::PreRead(f) = stage {
                f(property, node)?;
            }
        }
        Ok(())
    }

    /// Thread `value` through post-read or pre-write stages.
    pub fn run_transform(&self, property: &Property, node: &dyn Node, value: Value) -> Result<Value> {
        let mut value = value;
        for (_, stage) in &self.stages {
            value = match stage {
                Stage::PostRead(f) | Stage::PreWrite(f) => f(property, node, value)?,
                _ => value,
            };
        }
        Ok(value)
    }

    /// Run post-write stages in order.
    pub fn run_post_write(&self, property: &Property, node: &dyn Node, outcome: &WriteOutcome) -> Result<()> {
        for (_, stage) in &self.stages {
            if let Stage::PostWrite(f) = stage {
                f(property, node, outcome)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Composer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composer")
            .field("hook", &self.hook)
            .field("stages", &self.names())
            .finish()
    }
}
