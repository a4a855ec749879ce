//! Placeholder substitution for job specs.
//!
//! `${VAR}` and `$VAR` must resolve, `$$` is a literal dollar, and `{VAR}` is
//! replaced only when `VAR` is known so that literal braces in paths survive.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::error::{ContractError, Result};

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)|\{([A-Za-z_][A-Za-z0-9_]*)\}",
        )
        .unwrap_or_else(|e| panic!("placeholder regex is invalid: {}", e))
    })
}

/// Variables available to spec templates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateContext {
    vars: BTreeMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable, replacing any earlier value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Merge string-like values from a JSON object. Nulls are skipped and
    /// nested values are inserted in their JSON form.
    pub fn extend_from_json(&mut self, values: &serde_json::Map<String, Value>) {
        for (key, value) in values {
            match value {
                Value::Null => {}
                Value::String(s) => self.insert(key.clone(), s.clone()),
                other => self.insert(key.clone(), other.to_string()),
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Render one string.
    ///
    /// # Errors
    ///
    /// `ContractError::Config` when a `$` placeholder names an unknown variable.
    pub fn render(&self, input: &str) -> Result<String> {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;

        for caps in placeholder_regex().captures_iter(input) {
            let whole = caps.get(0).map_or(0..0, |m| m.range());
            out.push_str(&input[last..whole.start]);
            out.push_str(&self.expand(&caps, input)?);
            last = whole.end;
        }
        out.push_str(&input[last..]);
        Ok(out)
    }

    fn expand(&self, caps: &Captures<'_>, input: &str) -> Result<String> {
        if let Some(name) = caps.get(1).or_else(|| caps.get(2)) {
            return self.get(name.as_str()).map(str::to_string).ok_or_else(|| {
                ContractError::config(format!(
                    "template variable '{}' has no value (in \"{}\")",
                    name.as_str(),
                    input
                ))
            });
        }
        if let Some(name) = caps.get(3) {
            return Ok(match self.get(name.as_str()) {
                Some(value) => value.to_string(),
                None => format!("{{{}}}", name.as_str()),
            });
        }
        Ok("$".to_string())
    }

    /// Render every string inside a JSON value, keys untouched.
    pub fn render_value(&self, value: &Value) -> Result<Value> {
        Ok(match value {
            Value::String(s) => Value::String(self.render(s)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.render_value(v))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Object(map) => {
                let mut rendered = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    rendered.insert(k.clone(), self.render_value(v)?);
                }
                Value::Object(rendered)
            }
            other => other.clone(),
        })
    }
}

/// Parse repeated `KEY=VALUE` arguments
pub fn parse_var_pairs<S: AsRef<str>>(pairs: &[S]) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| {
            let pair = pair.as_ref();
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                ContractError::config(format!("invalid --var '{}': expected KEY=VALUE", pair))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ContractError::config(format!("invalid --var '{}': empty key", pair)));
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}
