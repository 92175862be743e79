//! Check compiler.
//!
//! A check is a `;`-separated list of boolean clauses. `{path}` placeholders
//! refer to the current value of another property reachable from the owning
//! node, `value` is the candidate value of a write. Clauses are compiled once
//! into evalexpr operator trees when the property is declared.
//!
//! ```text
//! "{output_enabled} == true; value >= 0"
//! ```
//!
//! For convenience `and`, `or`, `not`, `True` and `False` are accepted as
//! aliases of `&&`, `||`, `!`, `true` and `false`.

use evalexpr::{
    build_operator_tree, ContextWithMutableVariables, HashMapContext, Node as ExprTree,
};
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

use crate::error::{PropertyError, Result, StructuralError};
use crate::node::{Node, NodeExt};
use crate::value::Value;

/// Matches `{path}` field placeholders.
static FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}]+)\}").expect("Invalid field regex"));

/// Matches keyword aliases, or a whole string literal so that its content is
/// left as written.
static KEYWORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:[^"\\]|\\.)*"|\b(and|or|not|True|False)\b"#).expect("Invalid keyword regex")
});

/// Identifier bound to the candidate value in write checks.
const VALUE_IDENT: &str = "value";

/// Which chain the check runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckDirection {
    /// Evaluated before a read, `value` is not available
    Read,
    /// Evaluated before a write against the candidate value
    Write,
}

#[derive(Debug, Clone)]
struct Clause {
    /// Clause as written by the user, used in failure messages
    source: String,
    tree: ExprTree,
    /// `(identifier, path)` pairs of the fields used by this clause
    fields: Vec<(String, String)>,
}

/// A compiled check expression.
#[derive(Debug, Clone)]
pub struct CheckExpr {
    source: String,
    direction: CheckDirection,
    clauses: Vec<Clause>,
}

impl CheckExpr {
    /// Compile `source` for the given direction.
    ///
    /// Clauses that reference neither a field nor (for writes) the value can
    /// never change outcome at runtime and are dropped.
    pub fn compile(source: &str, direction: CheckDirection) -> Result<Self> {
        let mut clauses = Vec::new();
        for raw in source.split(';') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }

            let mut fields: Vec<(String, String)> = Vec::new();
            let rewritten = FIELD_RE.replace_all(raw, |caps: &regex::Captures<'_>| {
                let path = caps[1].trim().to_string();
                match fields.iter().position(|(_, p)| *p == path) {
                    Some(index) => fields[index].0.clone(),
                    None => {
                        let ident = format!("_f{}", fields.len());
                        fields.push((ident.clone(), path));
                        ident
                    }
                }
            });
            let rewritten = KEYWORD_RE.replace_all(&rewritten, |caps: &regex::Captures<'_>| {
                let Some(keyword) = caps.get(1) else {
                    return caps[0].to_string();
                };
                match keyword.as_str() {
                    "and" => "&&",
                    "or" => "||",
                    "not" => "!",
                    "True" => "true",
                    _ => "false",
                }
                .to_string()
            });

            let tree = build_operator_tree(&rewritten).map_err(|e| StructuralError::InvalidCheck {
                expression: raw.to_string(),
                message: e.to_string(),
            })?;

            let uses_value = tree
                .iter_variable_identifiers()
                .any(|ident| ident == VALUE_IDENT);
            let relevant = !fields.is_empty()
                || (direction == CheckDirection::Write && uses_value);
            if !relevant {
                debug!(clause = raw, "Dropping check clause without field or value");
                continue;
            }
            if direction == CheckDirection::Read && uses_value {
                return Err(StructuralError::InvalidCheck {
                    expression: raw.to_string(),
                    message: "'value' is only available in write checks".to_string(),
                }
                .into());
            }

            clauses.push(Clause {
                source: raw.to_string(),
                tree,
                fields,
            });
        }

        Ok(Self {
            source: source.to_string(),
            direction,
            clauses,
        })
    }

    /// Expression as declared.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the check guards reads or writes.
    pub fn direction(&self) -> CheckDirection {
        self.direction
    }

    /// Number of clauses kept after compilation.
    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    /// True when every clause was dropped at compile time.
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Paths of every property the check reads.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.clauses
            .iter()
            .flat_map(|c| c.fields.iter().map(|(_, path)| path.as_str()))
    }

    /// Evaluate every clause against the current state of `node`.
    pub fn evaluate(&self, property: &str, node: &dyn Node, value: Option<&Value>) -> Result<()> {
        self.evaluate_with(property, value, |path| node.read(path))
    }

    /// Evaluate every clause, reading fields through `fetch`.
    pub fn evaluate_with<F>(&self, property: &str, value: Option<&Value>, mut fetch: F) -> Result<()>
    where
        F: FnMut(&str) -> Result<Value>,
    {
        for clause in &self.clauses {
            let mut context = HashMapContext::new();
            let mut shown: Vec<(String, Value)> = Vec::new();

            if self.direction == CheckDirection::Write {
                if let Some(value) = value {
                    set_variable(&mut context, VALUE_IDENT, value, &clause.source)?;
                    shown.push((VALUE_IDENT.to_string(), value.clone()));
                }
            }
            for (ident, path) in &clause.fields {
                let current = fetch(path)?;
                set_variable(&mut context, ident, &current, &clause.source)?;
                shown.push((path.clone(), current));
            }

            let outcome = clause.tree.eval_boolean_with_context(&context);
            if !matches!(outcome, Ok(true)) {
                let verb = match self.direction {
                    CheckDirection::Read => "Getting",
                    CheckDirection::Write => "Setting",
                };
                let values = shown
                    .iter()
                    .map(|(name, v)| format!("{}={}", name, v))
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut message = format!(
                    "{} {}: assertion {} failed, values are : {}",
                    verb, property, clause.source, values
                );
                if let Err(e) = outcome {
                    message.push_str(&format!(" ({})", e));
                }
                return Err(PropertyError::validation(property, message));
            }
        }
        Ok(())
    }
}

/// Device answers are text; numeric-looking text is compared as a number.
fn expr_value(value: &Value) -> evalexpr::Value {
    if let Value::Str(s) = value {
        let trimmed = s.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            return evalexpr::Value::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return evalexpr::Value::Float(f);
        }
    }
    value.to_expr()
}

fn set_variable(context: &mut HashMapContext, ident: &str, value: &Value, clause: &str) -> Result<()> {
    context
        .set_value(ident.to_string(), expr_value(value))
        .map_err(|e| {
            StructuralError::InvalidCheck {
                expression: clause.to_string(),
                message: e.to_string(),
            }
            .into()
        })
}
