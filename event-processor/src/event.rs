use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::stream::RawEvent;

pub const EVENT_TYPE_HEADER: &str = "EventType";
pub const SOURCE_HEADER: &str = "Source";
pub const EVENT_ID_HEADER: &str = "EventId";
pub const UNKNOWN: &str = "Unknown";

/// Body keys carrying the business entity an event is about, in lookup order
pub const ORDER_ID_KEYS: &[&str] = &["OrderId", "orderId"];
pub const CUSTOMER_ID_KEYS: &[&str] = &["CustomerId", "customerId"];
pub const STATUS_KEYS: &[&str] = &["Status", "status"];

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("event has no payload")]
    Empty,
    #[error("event payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Closed set of event types with dedicated handling. Anything else is carried as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    OrderCreated,
    OrderStatusUpdated,
    Other(String),
}

impl EventKind {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "OrderCreated" => EventKind::OrderCreated,
            "OrderStatusUpdated" => EventKind::OrderStatusUpdated,
            other => EventKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::OrderCreated => "OrderCreated",
            EventKind::OrderStatusUpdated => "OrderStatusUpdated",
            EventKind::Other(tag) => tag,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded, read-only unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub source: String,
    pub body: Map<String, Value>,
    pub partition: i32,
}

impl Event {
    /// Decodes a stream record. Type and source come from headers, falling back to body fields.
    pub fn decode(raw: &RawEvent) -> Result<Self, DecodeError> {
        let payload = raw.payload.as_deref().ok_or(DecodeError::Empty)?;
        let body = match serde_json::from_slice::<Value>(payload)? {
            Value::Object(body) => body,
            other => return Err(DecodeError::NotAnObject(json_type_name(&other))),
        };

        let event_type = raw
            .header(EVENT_TYPE_HEADER)
            .map(str::to_string)
            .or_else(|| string_field(&body, &["EventType", "eventType", "type"]))
            .unwrap_or_else(|| UNKNOWN.to_string());
        let source = raw
            .header(SOURCE_HEADER)
            .map(str::to_string)
            .or_else(|| string_field(&body, &["Source", "source"]))
            .unwrap_or_else(|| UNKNOWN.to_string());
        let id = raw
            .header(EVENT_ID_HEADER)
            .map(str::to_string)
            .unwrap_or_else(|| raw.stream_id());

        Ok(Event {
            id,
            kind: EventKind::parse(&event_type),
            source,
            body,
            partition: raw.partition,
        })
    }

    pub fn event_type(&self) -> &str {
        self.kind.as_str()
    }

    /// First present key among `keys`, rendered as a string. Numbers and booleans are
    /// accepted since producers are not consistent about id types.
    pub fn field(&self, keys: &[&str]) -> Option<String> {
        string_field(&self.body, keys)
    }

    pub fn business_entity_id(&self) -> Option<String> {
        self.field(ORDER_ID_KEYS)
    }

    pub fn payload_keys(&self) -> Vec<&str> {
        self.body.keys().map(String::as_str).collect()
    }
}

fn string_field(body: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| body.get(*key))
        .find_map(|value| match value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
