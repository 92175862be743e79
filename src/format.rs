//! Response extraction formats.
//!
//! A `get_format` describes the shape of a device answer with `{}` or
//! `{name}` markers around the interesting parts, e.g. `"VOLT {}V"` or
//! `"{value},{unit}"`. It is compiled into an anchored regex when the
//! property is declared.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{PropertyError, Result, StructuralError};
use crate::value::Value;

static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)?\}").expect("Invalid marker regex"));

/// Compiled extraction format.
#[derive(Debug, Clone)]
pub struct ExtractFormat {
    source: String,
    regex: Regex,
}

impl ExtractFormat {
    /// Compile `format` into an anchored pattern.
    pub fn compile(format: &str) -> Result<Self> {
        let invalid = |message: &str| -> PropertyError {
            StructuralError::InvalidFormat {
                format: format.to_string(),
                message: message.to_string(),
            }
            .into()
        };

        let mut pattern = String::from("^");
        let mut last = 0;
        let mut markers = 0;
        for caps in MARKER_RE.captures_iter(format) {
            let Some(whole) = caps.get(0) else { continue };
            pattern.push_str(&regex::escape(&format[last..whole.start()]));
            match caps.get(1) {
                Some(name) => pattern.push_str(&format!("(?P<{}>.*?)", name.as_str())),
                None => pattern.push_str("(.*?)"),
            }
            last = whole.end();
            markers += 1;
        }
        if markers == 0 {
            return Err(invalid("no {} marker"));
        }
        pattern.push_str(&regex::escape(&format[last..]));
        pattern.push('$');

        let regex = Regex::new(&pattern).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self {
            source: format.to_string(),
            regex,
        })
    }

    /// Format as declared.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Pull the interesting field out of `answer`.
    ///
    /// The field named `value` wins, otherwise the first marker is used.
    /// Surrounding whitespace (line terminators) is ignored.
    pub fn extract(&self, property: &str, answer: &Value) -> Result<Value> {
        let text = answer.to_string();
        let text = text.trim();
        let caps = self.regex.captures(text).ok_or_else(|| {
            PropertyError::validation(
                property,
                format!(
                    "Getting {}: answer '{}' does not match format '{}'",
                    property, text, self.source
                ),
            )
        })?;
        let field = caps.name("value").or_else(|| caps.get(1));
        Ok(Value::from(field.map(|m| m.as_str()).unwrap_or_default()))
    }
}
