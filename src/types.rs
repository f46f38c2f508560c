//! Core data types shared across the runtime
//!
//! Attributes describe the named, typed data fields a device can expose or
//! accept. Values are the dynamically typed payloads flowing through script
//! executions, and a [`Sample`] is one ordered tuple of attribute values
//! produced by a script run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// The type of a device attribute or message field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    Integer,
    Float,
    Bool,
    String,
    Timestamp,
}

impl AttributeType {
    /// Human-readable type name, used in error messages
    pub fn name(&self) -> &'static str {
        match self {
            AttributeType::Integer => "integer",
            AttributeType::Float => "float",
            AttributeType::Bool => "bool",
            AttributeType::String => "string",
            AttributeType::Timestamp => "timestamp",
        }
    }
}

impl std::fmt::Display for AttributeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Access permission of a device attribute
///
/// Checked by the compiler: a script may only `put` readable attributes and
/// may only take writable attributes as caller parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Permission {
    pub fn readable(&self) -> bool {
        matches!(self, Permission::ReadOnly | Permission::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, Permission::WriteOnly | Permission::ReadWrite)
    }
}

/// A named, typed data field a device can expose or accept
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attribute {
    pub id: String,
    #[serde(rename = "type")]
    pub ty: AttributeType,
}

impl Attribute {
    pub fn new(id: impl Into<String>, ty: AttributeType) -> Self {
        Self { id: id.into(), ty }
    }
}

impl std::fmt::Display for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.id, self.ty)
    }
}

/// A dynamically typed value flowing through script executions
///
/// `Null` exists solely as the placeholder for sample slots that have not
/// been `put` yet; expressions never produce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
    Record(HashMap<String, Value>),
}

impl Value {
    /// Human-readable type name, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::String(_) => "string",
            Value::Timestamp(_) => "timestamp",
            Value::List(_) => "list",
            Value::Record(_) => "record",
        }
    }

    /// Whether this value inhabits the given attribute type
    pub fn matches(&self, ty: AttributeType) -> bool {
        matches!(
            (self, ty),
            (Value::Integer(_), AttributeType::Integer)
                | (Value::Float(_), AttributeType::Float)
                | (Value::Bool(_), AttributeType::Bool)
                | (Value::String(_), AttributeType::String)
                | (Value::Timestamp(_), AttributeType::Timestamp)
        )
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// One ordered tuple of attribute values produced by a script execution
///
/// The attribute list describing slot order is shared (`Arc`) between all
/// samples of the same script or operation, so cloning a sample is cheap.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    attributes: Arc<Vec<Attribute>>,
    values: Vec<Value>,
}

impl Sample {
    pub fn new(attributes: Arc<Vec<Attribute>>, values: Vec<Value>) -> Self {
        debug_assert_eq!(attributes.len(), values.len());
        Self { attributes, values }
    }

    /// The attribute list defining slot order
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Shared handle to the attribute list
    pub fn attributes_arc(&self) -> &Arc<Vec<Attribute>> {
        &self.attributes
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Value at slot `index`
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of the attribute named `id`
    pub fn field(&self, id: &str) -> Option<&Value> {
        let idx = self.attributes.iter().position(|a| a.id == id)?;
        self.values.get(idx)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(ids: &[&str]) -> Arc<Vec<Attribute>> {
        Arc::new(
            ids.iter()
                .map(|id| Attribute::new(*id, AttributeType::Integer))
                .collect(),
        )
    }

    #[test]
    fn test_permission_flags() {
        assert!(Permission::ReadOnly.readable());
        assert!(!Permission::ReadOnly.writable());
        assert!(Permission::WriteOnly.writable());
        assert!(!Permission::WriteOnly.readable());
        assert!(Permission::ReadWrite.readable());
        assert!(Permission::ReadWrite.writable());
    }

    #[test]
    fn test_value_type_match() {
        assert!(Value::Integer(3).matches(AttributeType::Integer));
        assert!(!Value::Integer(3).matches(AttributeType::Float));
        assert!(Value::Float(1.5).matches(AttributeType::Float));
        assert!(!Value::Null.matches(AttributeType::String));
    }

    #[test]
    fn test_value_as_float_widens_integers() {
        assert_eq!(Value::Integer(4).as_float(), Some(4.0));
        assert_eq!(Value::Float(2.5).as_float(), Some(2.5));
        assert_eq!(Value::Bool(true).as_float(), None);
    }

    #[test]
    fn test_sample_field_lookup() {
        let sample = Sample::new(
            attrs(&["pressure", "temperature"]),
            vec![Value::Integer(1013), Value::Integer(22)],
        );
        assert_eq!(sample.field("temperature"), Some(&Value::Integer(22)));
        assert_eq!(sample.field("humidity"), None);
        assert_eq!(sample.value(0), Some(&Value::Integer(1013)));
        assert_eq!(sample.len(), 2);
    }
}
