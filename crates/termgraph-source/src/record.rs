//! Uniform raw-record stream produced by every source adapter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One raw field value, before any vocabulary-specific interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Many(Vec<String>),
}

impl RawValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RawValue::Text(s) => Some(s),
            RawValue::Many(v) if v.len() == 1 => Some(&v[0]),
            _ => None,
        }
    }

    /// All textual values, whether the field is single- or multi-valued.
    pub fn texts(&self) -> Vec<&str> {
        match self {
            RawValue::Text(s) => vec![s.as_str()],
            RawValue::Many(v) => v.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            RawValue::Null => true,
            RawValue::Text(s) => s.trim().is_empty(),
            RawValue::Many(v) => v.is_empty(),
            _ => false,
        }
    }

    /// Append a value, promoting a single text into a multi-value.
    pub fn push_text(&mut self, value: String) {
        match self {
            RawValue::Many(v) => v.push(value),
            RawValue::Text(existing) => {
                let first = std::mem::take(existing);
                *self = RawValue::Many(vec![first, value]);
            }
            _ => *self = RawValue::Text(value),
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        RawValue::Text(value)
    }
}

/// One entry of a source release, keyed by its source-native code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub native_code: String,
    #[serde(default)]
    pub raw_fields: BTreeMap<String, RawValue>,
}

impl RawRecord {
    pub fn new(native_code: impl Into<String>) -> Self {
        Self {
            native_code: native_code.into(),
            raw_fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<RawValue>) -> Self {
        self.raw_fields.insert(key.to_string(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&RawValue> {
        self.raw_fields.get(key).filter(|v| !v.is_null())
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(RawValue::as_text)
    }

    pub fn texts(&self, key: &str) -> Vec<&str> {
        self.field(key).map(RawValue::texts).unwrap_or_default()
    }

    pub fn push_text(&mut self, key: &str, value: String) {
        match self.raw_fields.get_mut(key) {
            Some(existing) => existing.push_text(value),
            None => {
                self.raw_fields.insert(key.to_string(), RawValue::Text(value));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_text_promotes_to_many() {
        let mut r = RawRecord::new("HP:0000118");
        r.push_text("synonym", "a".to_string());
        assert_eq!(r.text("synonym"), Some("a"));
        r.push_text("synonym", "b".to_string());
        assert_eq!(r.texts("synonym"), vec!["a", "b"]);
        assert_eq!(r.text("synonym"), None);
    }

    #[test]
    fn blank_fields_read_as_absent() {
        let r = RawRecord::new("x").with_field("definition", "  ");
        assert!(r.field("definition").is_none());
        assert!(r.texts("definition").is_empty());
    }
}
