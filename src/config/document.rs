use serde::de::DeserializeOwned;
use serde_yaml::Value;
use std::env;

use crate::errors::ConfigError;

/// Prefix of an environment placeholder scalar: `env:VAR:default`.
const ENV_PLACEHOLDER: &str = "env:";

/// Immutable configuration tree parsed once from a source.
///
/// Environment placeholders are substituted when the document is built, so
/// every getter sees the final values. Mapping order follows the source.
#[derive(Debug)]
pub struct ConfigurationDocument {
    source: String,
    root: Value,
}

impl ConfigurationDocument {
    /// Build a document from an already parsed tree.
    pub fn new(source: impl Into<String>, mut root: Value) -> Self {
        resolve_env_placeholders(&mut root);
        Self {
            source: source.into(),
            root,
        }
    }

    pub fn from_yaml_str(source: &str, content: &str) -> Result<Self, ConfigError> {
        let root: Value = if content.trim().is_empty() {
            Value::Null
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| ConfigError::YamlParse(source.to_string(), e))?
        };
        Ok(Self::new(source, root))
    }

    pub fn from_toml_str(source: &str, content: &str) -> Result<Self, ConfigError> {
        let table: toml::Value =
            toml::from_str(content).map_err(|e| ConfigError::TomlParse(source.to_string(), e))?;
        let root = serde_yaml::to_value(table)
            .map_err(|e| ConfigError::Other(format!("Failed to convert '{}': {}", source, e)))?;
        Ok(Self::new(source, root))
    }

    /// Where the document was loaded from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Resolve a dotted path; `None` when any segment is missing.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        lookup(&self.root, path)
    }

    /// The subtree under `prefix`, or `None` when absent or null.
    pub fn get_config(&self, prefix: &str) -> Option<ConfigSection> {
        match self.lookup(prefix) {
            None | Some(Value::Null) => None,
            Some(value) => Some(ConfigSection::new(prefix, value.clone())),
        }
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.lookup(key)
            .and_then(scalar_to_string)
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.lookup(key).and_then(scalar_to_i64).unwrap_or(default)
    }

    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        self.lookup(key).and_then(scalar_to_f64).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.lookup(key).and_then(scalar_to_bool).unwrap_or(default)
    }

    pub fn get_list(&self, key: &str, default: Vec<String>) -> Vec<String> {
        self.lookup(key).and_then(value_to_list).unwrap_or(default)
    }

    /// Resolve a `${a.b.c:default}` expression to a string.
    ///
    /// A bare key without `${}` is looked up as-is with an empty default.
    /// `${env:VAR:default}` reads the environment instead of the document.
    pub fn value(&self, expr: &str) -> String {
        let expr = expr.trim();
        let inner = expr
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
            .unwrap_or(expr);
        if let Some(resolved) = resolve_env_placeholder(inner) {
            return resolved;
        }
        let (key, default) = match inner.split_once(':') {
            Some((key, default)) => (key.trim(), default),
            None => (inner.trim(), ""),
        };
        self.get_str(key, default)
    }
}

/// A named configuration subtree handed to section initializers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSection {
    prefix: String,
    value: Value,
}

impl ConfigSection {
    pub fn new(prefix: impl Into<String>, value: Value) -> Self {
        Self {
            prefix: prefix.into(),
            value,
        }
    }

    /// The full dotted prefix this section was resolved from.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn is_mapping(&self) -> bool {
        self.value.is_mapping()
    }

    pub fn contains(&self, key: &str) -> bool {
        lookup(&self.value, key).is_some()
    }

    /// Child sections in document order; empty when this is not a mapping.
    pub fn entries(&self) -> Vec<(String, ConfigSection)> {
        let Some(mapping) = self.value.as_mapping() else {
            return Vec::new();
        };
        mapping
            .iter()
            .filter_map(|(key, value)| {
                let key = scalar_to_string(key)?;
                let prefix = format!("{}.{}", self.prefix, key);
                Some((key, ConfigSection::new(prefix, value.clone())))
            })
            .collect()
    }

    pub fn get_config(&self, key: &str) -> Option<ConfigSection> {
        match lookup(&self.value, key) {
            None | Some(Value::Null) => None,
            Some(value) => Some(ConfigSection::new(
                format!("{}.{}", self.prefix, key),
                value.clone(),
            )),
        }
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        lookup(&self.value, key)
            .and_then(scalar_to_string)
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_opt_str(&self, key: &str) -> Option<String> {
        lookup(&self.value, key).and_then(scalar_to_string)
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        lookup(&self.value, key).and_then(scalar_to_i64).unwrap_or(default)
    }

    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        lookup(&self.value, key).and_then(scalar_to_f64).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        lookup(&self.value, key).and_then(scalar_to_bool).unwrap_or(default)
    }

    pub fn get_list(&self, key: &str, default: Vec<String>) -> Vec<String> {
        lookup(&self.value, key).and_then(value_to_list).unwrap_or(default)
    }

    /// Deserialize the whole subtree into a typed settings struct.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        serde_yaml::from_value(self.value.clone())
            .map_err(|e| ConfigError::Bind(self.prefix.clone(), e.to_string()))
    }
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Mapping(mapping) => mapping.get(segment)?,
            Value::Sequence(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn scalar_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

fn scalar_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn scalar_to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Sequences map element-wise; a string is split on commas.
fn value_to_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Sequence(items) => Some(items.iter().filter_map(scalar_to_string).collect()),
        Value::String(s) => {
            let s = s.trim().trim_matches(|c| c == '"' || c == '\'');
            Some(
                s.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect(),
            )
        }
        _ => None,
    }
}

fn resolve_env_placeholders(value: &mut Value) {
    match value {
        Value::String(s) => {
            if let Some(resolved) = resolve_env_placeholder(s) {
                *s = resolved;
            }
        }
        Value::Sequence(items) => items.iter_mut().for_each(resolve_env_placeholders),
        Value::Mapping(mapping) => mapping
            .iter_mut()
            .for_each(|(_, v)| resolve_env_placeholders(v)),
        Value::Tagged(tagged) => resolve_env_placeholders(&mut tagged.value),
        _ => {}
    }
}

/// `env:VAR:default` → value of `VAR`, or `default` (empty when omitted).
fn resolve_env_placeholder(raw: &str) -> Option<String> {
    let rest = raw.trim().strip_prefix(ENV_PLACEHOLDER)?;
    let (var, default) = match rest.split_once(':') {
        Some((var, default)) => (var.trim(), default),
        None => (rest.trim(), ""),
    };
    if var.is_empty() {
        return None;
    }
    Some(env::var(var).unwrap_or_else(|_| default.to_string()))
}
