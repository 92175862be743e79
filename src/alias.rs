//! Properties mirroring another property.

use std::sync::Arc;

use crate::composer::{HookPoint, ReadFn, WriteFn};
use crate::customization::Change;
use crate::error::{Result, StructuralError};
use crate::node::{Node, NodeExt};
use crate::property::{Property, PropertyConfig, OPERATION_STAGE};
use crate::value::Value;

/// Build a property reading (and, if `settable`, writing) the property at
/// `path`, relative to the node the alias is declared on.
///
/// Aliases never use the cache, the target does. The operation check is
/// left to the target as well.
pub fn alias(path: &str, settable: bool) -> Result<Property> {
    if path.is_empty() || path.ends_with('.') {
        return Err(StructuralError::InvalidPath(path.to_string()).into());
    }

    let mut property = Property::new(PropertyConfig::new().with_caching(false))?;
    property.modify_behavior_internal(HookPoint::PostWrite, Change::remove(OPERATION_STAGE))?;

    let target = path.to_string();
    let read: ReadFn = Arc::new(move |_: &Property, node: &dyn Node| node.read(&target));

    let write: Option<WriteFn> = if settable {
        let target = path.to_string();
        Some(Arc::new(move |_: &Property, node: &dyn Node, value: &Value| {
            node.write(&target, value.clone())?;
            Ok(Value::Null)
        }))
    } else {
        None
    };

    property.set_accessors(Some(read), write);
    Ok(property)
}
