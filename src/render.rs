//! `{{ var }}` template rendering with strict-undefined semantics.
//!
//! Commands, expect patterns, and verification patterns are all rendered
//! against the per-target variable map before use. Referencing a variable
//! that is not present fails the render; the error message names the
//! variable so the failure categorizes as a template error.

use crate::error::{Error, Result};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Per-target variable map.
pub type Variables = serde_json::Map<String, Value>;

fn var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern compiles")
    })
}

/// Renders `template`, substituting every `{{ name }}` placeholder from
/// `variables`. Strings substitute verbatim; other JSON values substitute as
/// their JSON rendering.
pub fn render(template: &str, variables: &Variables) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in var_re().captures_iter(template) {
        let whole = caps.get(0).expect("capture 0 always present");
        let name = &caps[1];
        let value = variables
            .get(name)
            .ok_or_else(|| Error::Render(format!("variable '{name}' is undefined")))?;
        out.push_str(&template[last..whole.start()]);
        match value {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}
