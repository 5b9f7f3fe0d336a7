//! Pulse Shared Types
//!
//! This crate provides the wire-level contracts shared by every component of
//! the realtime link: identity and group normalization, the message envelope,
//! the inbound payload codec, and the connection state machine.

pub mod codec;
pub mod contracts;
pub mod state_machine;

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;

/// Timing defaults for the realtime link
pub mod timing {
    /// First reconnect delay after a failed attempt
    pub const BACKOFF_FLOOR_MS: u64 = 1_000;

    /// Reconnect delay never grows past this
    pub const BACKOFF_CEILING_MS: u64 = 30_000;

    /// Upper bound of the random jitter added to each reconnect delay
    pub const BACKOFF_JITTER_MS: u64 = 1_000;

    /// How long a transport may take to report `connected` after opening
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 15_000;

    /// Without a successful connection for this long (measured from the first
    /// attempt), the link escalates to a hard recovery
    pub const ESCALATION_WINDOW_MS: u64 = 120_000;

    /// Liveness probe period of the heartbeat monitor
    pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

    /// Group every identity joins in addition to its personal group
    pub const BROADCAST_GROUP: &str = "broadcast";
}

fn normalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_lowercase())
}

/// Normalized (trimmed, lower-cased) identity of the connecting user
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    /// Normalize a raw identity; blank input yields `None`
    pub fn parse(raw: &str) -> Option<Self> {
        normalize(raw).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The group carrying messages addressed to this identity only
    pub fn personal_group(&self) -> GroupName {
        GroupName(self.0.clone())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized name of a pub/sub group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupName(String);

impl GroupName {
    /// Normalize a raw group name; blank input yields `None`
    pub fn parse(raw: &str) -> Option<Self> {
        normalize(raw).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An inbound message: `{ "type": ..., ...fields }`
///
/// The body is kept verbatim (including `type`); interpreting the remaining
/// fields is up to whoever subscribes to `kind`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    kind: String,
    body: Value,
}

impl Message {
    /// Build a message of the given kind from an object of extra fields.
    ///
    /// Non-object `fields` are discarded.
    pub fn new(kind: impl Into<String>, fields: Value) -> Self {
        let kind = kind.into();
        let mut body = match fields {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        body.insert("type".into(), Value::String(kind.clone()));
        Self {
            kind,
            body: Value::Object(body),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Look up a top-level field
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.body.get(field)
    }

    /// Deserialize the body into a typed contract
    pub fn decode_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }

    pub fn into_body(self) -> Value {
        self.body
    }
}

impl TryFrom<Value> for Message {
    type Error = codec::CodecError;

    fn try_from(body: Value) -> Result<Self, Self::Error> {
        let Value::Object(map) = &body else {
            return Err(codec::CodecError::NotAnObject);
        };
        let kind = match map.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(codec::CodecError::MissingType),
        };
        Ok(Self { kind, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_normalization() {
        let id = Identity::parse("  Alice@X.com ").unwrap();
        assert_eq!(id.as_str(), "alice@x.com");
        assert_eq!(id.personal_group().as_str(), "alice@x.com");
        assert!(Identity::parse("   ").is_none());
    }

    #[test]
    fn test_group_normalization() {
        assert_eq!(GroupName::parse(" Presence").unwrap().as_str(), "presence");
        assert!(GroupName::parse("").is_none());
    }

    #[test]
    fn test_message_new_sets_type() {
        let msg = Message::new("presence", json!({ "user": { "email": "bob@x.com" } }));
        assert_eq!(msg.kind(), "presence");
        assert_eq!(msg.get("type"), Some(&json!("presence")));
        assert_eq!(msg.get("user").unwrap()["email"], "bob@x.com");
    }

    #[test]
    fn test_message_from_value_requires_type() {
        assert!(Message::try_from(json!({ "user": 1 })).is_err());
        assert!(Message::try_from(json!([1, 2])).is_err());

        let msg = Message::try_from(json!({ "type": "chat-notification", "x": 1 })).unwrap();
        assert_eq!(msg.kind(), "chat-notification");
        assert_eq!(msg.body(), &json!({ "type": "chat-notification", "x": 1 }));
    }
}
