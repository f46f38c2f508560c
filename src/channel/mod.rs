//! Channel boundary: asynchronous device I/O and message mapping
//!
//! This module defines the traits the runtime consumes but does not
//! implement: transport [`Channel`]s that carry I/O requests to a device,
//! [`Mapper`]s that marshal typed [`Message`]s to and from wire payloads,
//! and the [`ChannelManager`] through which device-pushed (unsolicited)
//! messages reach the operations layer.
//!
//! The contracts mirror how the runtime is driven:
//!
//! - [`Channel::submit`] is asynchronous; the supplied [`IoHandler`] is
//!   invoked exactly once per submission, with either a payload or an error.
//! - [`ChannelManager::add_callback`] registers interest in one message
//!   type; pushes are delivered until the callback is removed.
//!
//! [`mock`] provides in-memory implementations for tests.

pub mod mock;

use crate::error::{Result, RuntimeError};
use crate::types::{AttributeType, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Raw wire payload exchanged with a channel
pub type Payload = Vec<u8>;

/// One I/O request bound for a device channel
///
/// Built afresh on every Submit instruction visit from the instruction's
/// parameter bindings; the channel implementation interprets the name and
/// parameters.
#[derive(Debug, Clone)]
pub struct IoRequest {
    pub name: String,
    pub parameters: HashMap<String, Value>,
}

impl IoRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: HashMap::new(),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }
}

/// Completion callback for one submitted request
///
/// Exactly one of `complete` or `error` is invoked per submission, on an
/// arbitrary transport thread. Implementations must not block.
pub trait IoHandler: Send + Sync {
    /// The request finished; `payload` is present for read-style requests
    fn complete(&self, request: &IoRequest, payload: Option<Payload>);

    /// The request failed
    fn error(&self, request: &IoRequest, cause: RuntimeError);
}

/// Asynchronous transport to one device endpoint
pub trait Channel: Send + Sync {
    /// Identifier the compiler resolves `submit` channel references against
    fn id(&self) -> &str;

    /// Submit a request; the handler fires exactly once, later or inline
    fn submit(&self, request: IoRequest, handler: Arc<dyn IoHandler>);
}

/// Descriptor of one field of a message type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: AttributeType,
    /// True when the field holds a list of `ty` values
    #[serde(default)]
    pub list: bool,
}

impl FieldDescriptor {
    pub fn scalar(name: impl Into<String>, ty: AttributeType) -> Self {
        Self {
            name: name.into(),
            ty,
            list: false,
        }
    }

    pub fn list(name: impl Into<String>, ty: AttributeType) -> Self {
        Self {
            name: name.into(),
            ty,
            list: true,
        }
    }
}

/// A typed, structured message exchanged with a device
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    message_type: String,
    fields: HashMap<String, Value>,
}

impl Message {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            fields: HashMap::new(),
        }
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    pub fn fields(&self) -> &HashMap<String, Value> {
        &self.fields
    }

    /// Append `value` to the list field `field`, creating it if absent
    pub fn append(&mut self, field: &str, value: Value) {
        match self.fields.get_mut(field) {
            Some(Value::List(items)) => items.push(value),
            _ => {
                self.fields
                    .insert(field.to_string(), Value::List(vec![value]));
            }
        }
    }

    /// View this message as a record value for the expression scope
    pub fn to_value(&self) -> Value {
        Value::Record(self.fields.clone())
    }
}

/// Marshals one message type to and from wire payloads
pub trait Mapper: Send + Sync {
    /// The message type this mapper handles
    fn message_type(&self) -> &str;

    /// Field descriptors, in declaration order
    fn fields(&self) -> &[FieldDescriptor];

    /// Descriptor of the field named `name`
    fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields().iter().find(|f| f.name == name)
    }

    /// Create an empty message of this type
    fn create(&self) -> Message {
        Message::new(self.message_type().to_string())
    }

    /// Serialize a message into a wire payload
    fn marshal(&self, message: &Message) -> Result<Payload>;

    /// Deserialize a wire payload into a message
    fn unmarshal(&self, payload: &Payload) -> Result<Message>;
}

/// Callback invoked for every device-pushed message of a registered type
pub trait MessageCallback: Send + Sync {
    fn on_message(&self, message: Message);
}

/// Registry for unsolicited (device-pushed) message delivery
///
/// Operations register a callback per message type while they are running
/// and must remove it when they stop.
pub trait ChannelManager: Send + Sync {
    /// Deliver pushes of `mapper`'s message type to `callback`
    fn add_callback(&self, mapper: Arc<dyn Mapper>, callback: Arc<dyn MessageCallback>);

    /// Stop delivering pushes of `message_type`
    fn remove_callback(&self, message_type: &str);
}

/// JSON-backed [`Mapper`] implementation
///
/// Field values are marshalled as a flat JSON object. This is the mapper the
/// crate ships; transport-specific mappers live with their channels.
pub struct JsonMapper {
    message_type: String,
    fields: Vec<FieldDescriptor>,
}

impl JsonMapper {
    pub fn new(message_type: impl Into<String>, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            message_type: message_type.into(),
            fields,
        }
    }

    fn mapper_error(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError::Mapper {
            message_type: self.message_type.clone(),
            message: message.into(),
        }
    }
}

impl Mapper for JsonMapper {
    fn message_type(&self) -> &str {
        &self.message_type
    }

    fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    fn marshal(&self, message: &Message) -> Result<Payload> {
        serde_json::to_vec(message.fields()).map_err(|e| self.mapper_error(e.to_string()))
    }

    fn unmarshal(&self, payload: &Payload) -> Result<Message> {
        let fields: HashMap<String, Value> =
            serde_json::from_slice(payload).map_err(|e| self.mapper_error(e.to_string()))?;

        let mut message = Message::new(self.message_type.clone());
        for (name, value) in fields {
            message.set(name, value);
        }
        Ok(message)
    }
}
