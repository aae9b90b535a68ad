//! The unit exchanged over the bus.
//!
//! A `Command` is addressed by `type` (which handlers run), `from` (the sending
//! member), and optionally `to` (a single target member; absent means broadcast).
//! Replies carry `replyTo`, the id of the command being answered, and are routed to the
//! sender's pending correlation entry instead of to type-registered handlers.
//!
//! Wire shape: `{id, type, from, to?, replyTo?, date, channel, ...payload}`. `channel` is
//! transport metadata attached by the broker and is stripped again on decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use clustercmd_core::{CommandId, MemberId};

/// Field the broker attaches to every persisted/transmitted record.
pub const CHANNEL_FIELD: &str = "channel";

/// Envelope keys. The payload is flattened beside them, so it may not use any of these.
pub const RESERVED_FIELDS: [&str; 7] = ["id", "type", "from", "to", "replyTo", "date", CHANNEL_FIELD];

/// First payload key that would overwrite an envelope field on the wire.
pub fn reserved_key(payload: &Map<String, JsonValue>) -> Option<&'static str> {
    RESERVED_FIELDS.into_iter().find(|key| payload.contains_key(*key))
}

/// Why a wire record could not be turned back into a `Command`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandDecodeError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("record has no non-empty `type`")]
    MissingType,

    #[error("malformed command record: {0}")]
    Malformed(String),

    #[error("payload field `{0}` collides with the command envelope")]
    ReservedField(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,

    #[serde(rename = "type")]
    pub command_type: String,

    pub from: MemberId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<MemberId>,

    #[serde(rename = "replyTo", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<CommandId>,

    pub date: DateTime<Utc>,

    /// Type-specific fields, flattened into the top-level record.
    #[serde(flatten)]
    pub payload: Map<String, JsonValue>,
}

impl Command {
    /// A broadcast command with a fresh id, stamped now.
    pub fn new(command_type: impl Into<String>, from: MemberId) -> Self {
        Self {
            id: CommandId::new(),
            command_type: command_type.into(),
            from,
            to: None,
            reply_to: None,
            date: Utc::now(),
            payload: Map::new(),
        }
    }

    pub fn with_to(mut self, to: MemberId) -> Self {
        self.to = Some(to);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// Payload field lookup.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.payload.get(key)
    }

    /// Payload field as a string, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(JsonValue::as_str)
    }

    /// Encode for the transport, attaching `channel`.
    pub fn to_wire(&self, channel: &str) -> Result<JsonValue, CommandDecodeError> {
        if let Some(key) = reserved_key(&self.payload) {
            return Err(CommandDecodeError::ReservedField(key.to_string()));
        }
        let mut value =
            serde_json::to_value(self).map_err(|e| CommandDecodeError::Malformed(e.to_string()))?;
        match value.as_object_mut() {
            Some(obj) => {
                obj.insert(CHANNEL_FIELD.to_string(), JsonValue::String(channel.to_string()));
                Ok(value)
            }
            None => Err(CommandDecodeError::NotAnObject),
        }
    }

    /// Decode a transport record into `(channel, command)`.
    ///
    /// Records that are not objects or lack a non-empty `type` are rejected.
    pub fn from_wire(value: JsonValue) -> Result<(String, Command), CommandDecodeError> {
        let JsonValue::Object(mut obj) = value else {
            return Err(CommandDecodeError::NotAnObject);
        };

        match obj.get("type").and_then(JsonValue::as_str) {
            Some(t) if !t.is_empty() => {}
            _ => return Err(CommandDecodeError::MissingType),
        }

        let channel = match obj.remove(CHANNEL_FIELD) {
            Some(JsonValue::String(c)) => c,
            _ => String::new(),
        };

        let command: Command = serde_json::from_value(JsonValue::Object(obj))
            .map_err(|e| CommandDecodeError::Malformed(e.to_string()))?;

        Ok((channel, command))
    }
}
