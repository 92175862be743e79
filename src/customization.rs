//! Customization log and replay.
//!
//! Every user modification of a property's pipelines goes through
//! [`Property::modify_behavior`], which applies a [`Change`] to the live
//! composer and records it in the property's [`CustomLog`]. When a property
//! is re-derived from new construction arguments, the log of the old
//! property is replayed onto the new one by [`replay`].
//!
//! Replay is best effort. A change anchored on a stage that no longer exists
//! is inserted next to the closest stage that still does:
//!
//! - "add after" walks the source sequence backward from the anchor's old
//!   position and falls back to prepending
//! - "add before" walks forward and falls back to appending

use indexmap::IndexMap;
use tracing::debug;

use crate::composer::{Composer, HookPoint, ReadFn, Stage, WriteFn};
use crate::error::Result;
use crate::property::Property;

/// Name given to the stage installed by [`Change::Override`].
pub const REPLACED_STAGE: &str = "replaced";

/// A modification of one composer.
#[derive(Debug, Clone)]
pub enum Change {
    /// Replace the whole hook point with a single stage
    Override(Stage),
    /// Insert first
    Prepend { name: String, stage: Stage },
    /// Insert last
    Append { name: String, stage: Stage },
    /// Insert right before `anchor`
    AddBefore { anchor: String, name: String, stage: Stage },
    /// Insert right after `anchor`
    AddAfter { anchor: String, name: String, stage: Stage },
    /// Swap the body of an existing stage, keeping its position
    Replace { name: String, stage: Stage },
    /// Drop an existing stage
    Remove { name: String },
}

impl Change {
    /// See [`Change::Prepend`].
    pub fn prepend(name: &str, stage: Stage) -> Self {
        Change::Prepend {
            name: name.to_string(),
            stage,
        }
    }

    /// See [`Change::Append`].
    pub fn append(name: &str, stage: Stage) -> Self {
        Change::Append {
            name: name.to_string(),
            stage,
        }
    }

    /// See [`Change::AddBefore`].
    pub fn add_before(anchor: &str, name: &str, stage: Stage) -> Self {
        Change::AddBefore {
            anchor: anchor.to_string(),
            name: name.to_string(),
            stage,
        }
    }

    /// See [`Change::AddAfter`].
    pub fn add_after(anchor: &str, name: &str, stage: Stage) -> Self {
        Change::AddAfter {
            anchor: anchor.to_string(),
            name: name.to_string(),
            stage,
        }
    }

    /// See [`Change::Replace`].
    pub fn replace(name: &str, stage: Stage) -> Self {
        Change::Replace {
            name: name.to_string(),
            stage,
        }
    }

    /// See [`Change::Remove`].
    pub fn remove(name: &str) -> Self {
        Change::Remove {
            name: name.to_string(),
        }
    }

    /// Apply the change to a live composer.
    pub fn apply(&self, composer: &mut Composer) -> Result<()> {
        match self {
            Change::Override(stage) => {
                // Validate before wiping the existing stages
                let mut fresh = Composer::new(composer.hook());
                fresh.append(REPLACED_STAGE, stage.clone())?;
                *composer = fresh;
                Ok(())
            }
            Change::Prepend { name, stage } => composer.prepend(name, stage.clone()),
            Change::Append { name, stage } => composer.append(name, stage.clone()),
            Change::AddBefore { anchor, name, stage } => {
                composer.add_before(anchor, name, stage.clone())
            }
            Change::AddAfter { anchor, name, stage } => {
                composer.add_after(anchor, name, stage.clone())
            }
            Change::Replace { name, stage } => composer.replace(name, stage.clone()),
            Change::Remove { name } => composer.remove(name).map(|_| ()),
        }
    }
}

/// How a stage was attached, as remembered by the log.
#[derive(Debug, Clone)]
pub enum Record {
    /// Inserted first
    Prepend(Stage),
    /// Inserted last
    Append(Stage),
    /// Inserted before `anchor`, which was present at the time
    AddBefore { anchor: String, stage: Stage },
    /// Inserted after `anchor`, which was present at the time
    AddAfter { anchor: String, stage: Stage },
    /// A built-in stage swapped for a custom callable
    Replace(Stage),
    /// A built-in stage removed
    Remove,
}

impl Record {
    fn set_stage(&mut self, new: Stage) {
        match self {
            Record::Prepend(stage)
            | Record::Append(stage)
            | Record::AddBefore { stage, .. }
            | Record::AddAfter { stage, .. }
            | Record::Replace(stage) => *stage = new,
            Record::Remove => *self = Record::Replace(new),
        }
    }
}

/// Customizations of one hook point.
#[derive(Debug, Clone)]
pub enum HookLog {
    /// The hook was overridden wholesale
    Replaced(Stage),
    /// Stage name to record, in insertion order
    Staged(IndexMap<String, Record>),
}

/// Every user customization applied to a property.
#[derive(Clone, Default)]
pub struct CustomLog {
    pub(crate) read: Option<ReadFn>,
    pub(crate) write: Option<WriteFn>,
    hooks: IndexMap<HookPoint, HookLog>,
}

impl CustomLog {
    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none() && self.hooks.is_empty()
    }

    /// Customizations recorded for `hook`.
    pub fn hook(&self, hook: HookPoint) -> Option<&HookLog> {
        self.hooks.get(&hook)
    }

    /// Recorded changes grouped by hook.
    pub fn hooks(&self) -> impl Iterator<Item = (&HookPoint, &HookLog)> {
        self.hooks.iter()
    }

    /// Remember a change that was successfully applied to `hook`.
    pub fn record(&mut self, hook: HookPoint, change: &Change) {
        if let Change::Override(stage) = change {
            self.hooks.insert(hook, HookLog::Replaced(stage.clone()));
            return;
        }

        let entry = self
            .hooks
            .entry(hook)
            .or_insert_with(|| HookLog::Staged(IndexMap::new()));
        if let HookLog::Replaced(stage) = entry {
            let mut staged = IndexMap::new();
            staged.insert(REPLACED_STAGE.to_string(), Record::Prepend(stage.clone()));
            *entry = HookLog::Staged(staged);
        }
        let HookLog::Staged(records) = entry else {
            return;
        };

        match change {
            Change::Override(_) => {}
            Change::Prepend { name, stage } => {
                records.shift_remove(name);
                records.insert(name.clone(), Record::Prepend(stage.clone()));
            }
            Change::Append { name, stage } => {
                records.shift_remove(name);
                records.insert(name.clone(), Record::Append(stage.clone()));
            }
            Change::AddBefore { anchor, name, stage } => {
                records.shift_remove(name);
                records.insert(
                    name.clone(),
                    Record::AddBefore {
                        anchor: anchor.clone(),
                        stage: stage.clone(),
                    },
                );
            }
            Change::AddAfter { anchor, name, stage } => {
                records.shift_remove(name);
                records.insert(
                    name.clone(),
                    Record::AddAfter {
                        anchor: anchor.clone(),
                        stage: stage.clone(),
                    },
                );
            }
            Change::Replace { name, stage } => match records.get_mut(name) {
                Some(record) => record.set_stage(stage.clone()),
                None => {
                    records.insert(name.clone(), Record::Replace(stage.clone()));
                }
            },
            Change::Remove { name } => match records.shift_remove(name) {
                // A custom stage removed again leaves nothing to replay
                Some(Record::Prepend(_))
                | Some(Record::Append(_))
                | Some(Record::AddBefore { .. })
                | Some(Record::AddAfter { .. }) => {}
                Some(Record::Replace(_)) | Some(Record::Remove) | None => {
                    records.insert(name.clone(), Record::Remove);
                }
            },
        }
    }
}

impl std::fmt::Debug for CustomLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomLog")
            .field("read", &self.read.is_some())
            .field("write", &self.write.is_some())
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// Replay the customizations of `source` onto `dest`.
pub(crate) fn replay(dest: &mut Property, source: &Property) -> Result<()> {
    if let Some(read) = &source.customs.read {
        dest.override_read_with(read.clone());
    }
    if let Some(write) = &source.customs.write {
        dest.override_write_with(write.clone());
    }

    for (hook, log) in source.customs.hooks() {
        let hook = *hook;
        let records = match log {
            HookLog::Replaced(stage) => {
                dest.modify_behavior(hook, Change::Override(stage.clone()))?;
                continue;
            }
            HookLog::Staged(records) => records,
        };

        let source_names: Vec<String> = source
            .composer(hook)
            .names()
            .into_iter()
            .map(String::from)
            .collect();

        for (name, record) in records {
            let change = match record {
                Record::Prepend(stage) => Change::prepend(name, stage.clone()),
                Record::Append(stage) => Change::append(name, stage.clone()),
                Record::Remove => {
                    if !dest.composer(hook).contains(name) {
                        debug!(
                            property = dest.name(),
                            %hook,
                            stage = name.as_str(),
                            "Skipping removal of absent stage"
                        );
                        continue;
                    }
                    Change::remove(name)
                }
                Record::Replace(stage) => {
                    if dest.composer(hook).contains(name) {
                        Change::replace(name, stage.clone())
                    } else {
                        // Re-insert where the replaced stage used to be
                        after_fallback(dest.composer(hook), &source_names, name, name, stage)
                    }
                }
                Record::AddAfter { anchor, stage } => {
                    if dest.composer(hook).contains(anchor) {
                        Change::add_after(anchor, name, stage.clone())
                    } else {
                        after_fallback(dest.composer(hook), &source_names, anchor, name, stage)
                    }
                }
                Record::AddBefore { anchor, stage } => {
                    if dest.composer(hook).contains(anchor) {
                        Change::add_before(anchor, name, stage.clone())
                    } else {
                        before_fallback(dest.composer(hook), &source_names, anchor, name, stage)
                    }
                }
            };
            dest.modify_behavior(hook, change)?;
        }
    }
    Ok(())
}

/// Position in the source sequence the search starts from: the anchor's
/// old position, or the custom stage's own position if the anchor is gone.
fn search_start(source_names: &[String], anchor: &str, name: &str) -> Option<usize> {
    source_names
        .iter()
        .position(|n| n == anchor)
        .or_else(|| source_names.iter().position(|n| n == name))
}

fn after_fallback(
    dest: &Composer,
    source_names: &[String],
    anchor: &str,
    name: &str,
    stage: &Stage,
) -> Change {
    let found = search_start(source_names, anchor, name).and_then(|start| {
        source_names[..=start]
            .iter()
            .rev()
            .find(|n| n.as_str() != name && dest.contains(n))
    });
    match found {
        Some(neighbor) => {
            debug!(
                hook = %dest.hook(),
                stage = name,
                missing = anchor,
                anchor = neighbor.as_str(),
                "Anchor missing, inserting after closest preceding stage"
            );
            Change::add_after(neighbor, name, stage.clone())
        }
        None => {
            debug!(hook = %dest.hook(), stage = name, missing = anchor, "Anchor missing, prepending");
            Change::prepend(name, stage.clone())
        }
    }
}

fn before_fallback(
    dest: &Composer,
    source_names: &[String],
    anchor: &str,
    name: &str,
    stage: &Stage,
) -> Change {
    let found = search_start(source_names, anchor, name).and_then(|start| {
        source_names[start..]
            .iter()
            .find(|n| n.as_str() != name && dest.contains(n))
    });
    match found {
        Some(neighbor) => {
            debug!(
                hook = %dest.hook(),
                stage = name,
                missing = anchor,
                anchor = neighbor.as_str(),
                "Anchor missing, inserting before closest following stage"
            );
            Change::add_before(neighbor, name, stage.clone())
        }
        None => {
            debug!(hook = %dest.hook(), stage = name, missing = anchor, "Anchor missing, appending");
            Change::append(name, stage.clone())
        }
    }
}
