use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// String-keyed option bag with typed accessors, shared by every configurable
/// component.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Options(Map<String, Value>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Numbers, or strings holding numbers.
    pub fn f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn usize(&self, key: &str) -> Option<usize> {
        self.i64(key).and_then(|v| usize::try_from(v).ok())
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(true),
                "false" | "no" | "off" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// A list of strings, or a single whitespace/comma separated string.
    pub fn str_list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => s
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn require_str(&self, component: &str, key: &str) -> Result<&str, ConfigurationError> {
        self.str(key).ok_or_else(|| missing(component, key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

fn missing(component: &str, key: &str) -> ConfigurationError {
    ConfigurationError::MissingOption {
        component: component.to_string(),
        option: key.to_string(),
    }
}

/// Registry entry for one configured component.
///
/// `requires` names other descriptors (for example the channels a composite
/// channel is derived from); links are resolved by name, never by pointer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Descriptor {
    pub name: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(alias = "class")]
    pub class_name: String,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub consumes: BTreeSet<String>,
    #[serde(default)]
    pub produces: BTreeSet<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    /// Set by the engine once a station has resolved this definition.
    #[serde(skip)]
    pub used: bool,
}

impl Descriptor {
    pub fn new(name: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class_name: class_name.into(),
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.set(key, value);
        self
    }

    pub fn consuming<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.consumes.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn producing<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.produces.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn requiring<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires.extend(names.into_iter().map(Into::into));
        self
    }

    /// The routing tag; defaults to the component name.
    pub fn tag_or_name(&self) -> &str {
        self.tag.as_deref().unwrap_or(&self.name)
    }
}
