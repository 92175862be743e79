//! Range validation for written values.
//!
//! A property either carries static limits or refers to limits declared on
//! its node by id. Named limits are fetched from the device the first time
//! they are needed and memoized in the node's [`LimitsStore`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::value::Value;

/// Relative tolerance used when checking float steps.
const STEP_TOLERANCE: f64 = 1e-9;

/// Minimum/maximum/step predicate. Every bound is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitsValidator {
    /// Smallest accepted value
    #[serde(default)]
    pub minimum: Option<f64>,
    /// Largest accepted value
    #[serde(default)]
    pub maximum: Option<f64>,
    /// Values must be `minimum` plus a multiple of the step
    #[serde(default)]
    pub step: Option<f64>,
    /// Reject values with a fractional part
    #[serde(default)]
    pub integral: bool,
}

impl LimitsValidator {
    /// Integer limits
    pub fn int(minimum: Option<i64>, maximum: Option<i64>, step: Option<i64>) -> Self {
        Self {
            minimum: minimum.map(|v| v as f64),
            maximum: maximum.map(|v| v as f64),
            step: step.map(|v| v as f64),
            integral: true,
        }
    }

    /// Float limits
    pub fn float(minimum: Option<f64>, maximum: Option<f64>, step: Option<f64>) -> Self {
        Self {
            minimum,
            maximum,
            step,
            integral: false,
        }
    }

    /// Check that `value` is numeric and lies within the bounds.
    ///
    /// Steps are counted from the minimum when there is one, from zero
    /// otherwise.
    pub fn validate(&self, value: &Value) -> bool {
        let Some(v) = value.as_f64() else {
            return false;
        };
        if !v.is_finite() {
            return false;
        }
        if self.integral && v.fract() != 0.0 {
            return false;
        }
        if matches!(self.minimum, Some(min) if v < min) {
            return false;
        }
        if matches!(self.maximum, Some(max) if v > max) {
            return false;
        }
        match self.step {
            Some(step) if step > 0.0 => {
                let offset = (v - self.minimum.unwrap_or(0.0)) / step;
                (offset - offset.round()).abs() <= STEP_TOLERANCE * offset.abs().max(1.0)
            }
            _ => true,
        }
    }
}

/// Where a property finds its limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LimitsSource {
    /// Id of limits declared on the owning node
    Named(String),
    /// Fixed limits
    Static(LimitsValidator),
}

impl From<LimitsValidator> for LimitsSource {
    fn from(limits: LimitsValidator) -> Self {
        LimitsSource::Static(limits)
    }
}

impl From<&str> for LimitsSource {
    fn from(id: &str) -> Self {
        LimitsSource::Named(id.to_string())
    }
}

/// Per-node memo of fetched named limits.
#[derive(Debug, Default)]
pub struct LimitsStore {
    values: Mutex<HashMap<String, LimitsValidator>>,
}

impl LimitsStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Memoized limits `id`.
    pub fn get(&self, id: &str) -> Option<LimitsValidator> {
        self.values.lock().get(id).cloned()
    }

    /// Memoize `limits` under `id`.
    pub fn insert(&self, id: &str, limits: LimitsValidator) {
        self.values.lock().insert(id.to_string(), limits);
    }

    /// Forget memoized limits. `None` forgets all of them.
    pub fn discard(&self, ids: Option<&[String]>) {
        let mut values = self.values.lock();
        match ids {
            Some(ids) => {
                for id in ids {
                    values.remove(id);
                }
            }
            None => values.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_bounds() {
        let limits = LimitsValidator::float(Some(0.0), Some(10.0), None);
        assert!(limits.validate(&Value::Int(0)));
        assert!(limits.validate(&Value::Float(10.0)));
        assert!(!limits.validate(&Value::Int(15)));
        assert!(!limits.validate(&Value::Float(-0.1)));
        assert!(!limits.validate(&Value::from("5")));
    }

    #[test]
    fn test_open_bounds() {
        let limits = LimitsValidator::float(None, Some(1.0), None);
        assert!(limits.validate(&Value::Float(-1e6)));
        assert!(!limits.validate(&Value::Float(1.5)));
    }

    #[test]
    fn test_step_counted_from_minimum() {
        let limits = LimitsValidator::int(Some(1), Some(11), Some(2));
        assert!(limits.validate(&Value::Int(1)));
        assert!(limits.validate(&Value::Int(5)));
        assert!(!limits.validate(&Value::Int(4)));
        assert!(!limits.validate(&Value::Float(5.5)));
    }

    #[test]
    fn test_float_step_tolerance() {
        let limits = LimitsValidator::float(Some(0.0), Some(1.0), Some(0.1));
        assert!(limits.validate(&Value::Float(0.3)));
        assert!(!limits.validate(&Value::Float(0.35)));
    }

    #[test]
    fn test_source_deserialization() {
        let named: LimitsSource = serde_json::from_str(r#""voltage_range""#).unwrap();
        assert_eq!(named, LimitsSource::Named("voltage_range".into()));
        let fixed: LimitsSource = serde_json::from_str(r#"{"minimum": 0, "maximum": 10}"#).unwrap();
        assert_eq!(
            fixed,
            LimitsSource::Static(LimitsValidator::float(Some(0.0), Some(10.0), None))
        );
    }

    #[test]
    fn test_store_discard() {
        let store = LimitsStore::new();
        store.insert("a", LimitsValidator::default());
        store.insert("b", LimitsValidator::default());
        store.discard(Some(&["a".to_string()]));
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_some());
        store.discard(None);
        assert!(store.get("b").is_none());
    }
}
