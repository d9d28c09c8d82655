//! Typed open maps for notification metadata and template variables.
//!
//! Metadata and template-variable maps are extensible by callers but stay
//! constrained to primitive values, so the engine never has to deal with
//! arbitrarily nested structures.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A primitive value in a metadata or template-variable map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Null,
}

/// Open map keyed by string, constrained to primitive values.
pub type MetaMap = HashMap<String, MetaValue>;

impl MetaValue {
    /// Stringified form used for template substitution.
    pub fn display_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::Null => String::new(),
        }
    }

    /// Truthiness used by `{{#if}}` / `{{#unless}}` blocks.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Boolean(b) => *b,
            Self::Integer(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::String(s) => !s.is_empty(),
            Self::Null => false,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_string() {
        assert_eq!(MetaValue::from("Ann").display_string(), "Ann");
        assert_eq!(MetaValue::from(42).display_string(), "42");
        assert_eq!(MetaValue::from(true).display_string(), "true");
        assert_eq!(MetaValue::Null.display_string(), "");
    }

    #[test]
    fn test_truthiness() {
        assert!(MetaValue::from(true).is_truthy());
        assert!(!MetaValue::from(false).is_truthy());
        assert!(MetaValue::from("x").is_truthy());
        assert!(!MetaValue::from("").is_truthy());
        assert!(MetaValue::from(1).is_truthy());
        assert!(!MetaValue::from(0).is_truthy());
        assert!(!MetaValue::Null.is_truthy());
    }

    #[test]
    fn test_deserialize_untagged() {
        let map: MetaMap =
            serde_json::from_str(r#"{"name":"Ann","count":3,"active":true,"note":null}"#).unwrap();
        assert_eq!(map["name"], MetaValue::from("Ann"));
        assert_eq!(map["count"], MetaValue::from(3));
        assert_eq!(map["active"], MetaValue::from(true));
        assert_eq!(map["note"], MetaValue::Null);
    }
}
