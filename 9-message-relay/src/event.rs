use std::{fmt, str};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::backend::{BackendRequest, Route};

/// Identifier as it appears on the wire: clients and the backend use both
/// JSON strings and integers for the same fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    Text(String),
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(id) => write!(f, "{id}"),
            Id::Text(id) => f.write_str(id),
        }
    }
}

impl From<&Id> for Value {
    fn from(id: &Id) -> Self {
        match id {
            Id::Number(id) => Value::from(*id),
            Id::Text(id) => Value::from(id.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceKind {
    Focus,
    ActiveTyping,
    IdleTyping,
    Blur,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SendMessage,
    DeliveredMessage,
    ReadMessage,
    Presence(PresenceKind),
    EditMessage,
    DeleteMessage,
}

impl EventKind {
    pub fn parse(tag: &str) -> Option<Self> {
        let kind = match tag {
            "send_message" => EventKind::SendMessage,
            "delivered_message" => EventKind::DeliveredMessage,
            "read_message" => EventKind::ReadMessage,
            "focus" => EventKind::Presence(PresenceKind::Focus),
            "active-typing" => EventKind::Presence(PresenceKind::ActiveTyping),
            "idle-typing" => EventKind::Presence(PresenceKind::IdleTyping),
            "blur" => EventKind::Presence(PresenceKind::Blur),
            "edit_message" => EventKind::EditMessage,
            "delete_message" => EventKind::DeleteMessage,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::SendMessage => "send_message",
            EventKind::DeliveredMessage => "delivered_message",
            EventKind::ReadMessage => "read_message",
            EventKind::Presence(PresenceKind::Focus) => "focus",
            EventKind::Presence(PresenceKind::ActiveTyping) => "active-typing",
            EventKind::Presence(PresenceKind::IdleTyping) => "idle-typing",
            EventKind::Presence(PresenceKind::Blur) => "blur",
            EventKind::EditMessage => "edit_message",
            EventKind::DeleteMessage => "delete_message",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid UTF-8")]
    Utf8(#[from] str::Utf8Error),
    #[error("frame is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("unknown event kind `{0}`")]
    UnknownKind(String),
    #[error("invalid {kind} envelope: {source}")]
    InvalidEnvelope {
        kind: EventKind,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SendMessage {
    pub message_id: Id,
    pub conversation_id: Id,
    pub sender_id: Id,
    pub message: String,
    pub time: Option<Value>,
    /// Any shape is accepted; only an object's `id` becomes the parent.
    pub reply: Option<Value>,
    pub files: Option<Value>,
    /// The envelope exactly as received; participants get it back verbatim.
    #[serde(skip)]
    pub envelope: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeliveredMessage {
    pub message_id: Id,
    pub conversation_id: Id,
    pub sender_id: Id,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReadMessage {
    pub conversation_id: Id,
    pub sender_id: Id,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Presence {
    pub conversation_id: Id,
    pub sender_id: Option<Id>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EditMessage {
    pub message: String,
    pub message_id: Id,
    pub conversation_id: Option<Id>,
    pub sender_id: Option<Id>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeleteMessage {
    pub message_id: Id,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    SendMessage(SendMessage),
    DeliveredMessage(DeliveredMessage),
    ReadMessage(ReadMessage),
    Presence(PresenceKind, Presence),
    EditMessage(EditMessage),
    DeleteMessage(DeleteMessage),
}

/// Decodes one inbound frame. Binary and text frames share this path.
pub fn decode(frame: &[u8]) -> Result<InboundEvent, DecodeError> {
    let text = str::from_utf8(frame)?;
    let value: Value = serde_json::from_str(text).map_err(DecodeError::Json)?;
    let Value::Object(envelope) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let tag = envelope
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?;
    let kind = EventKind::parse(tag).ok_or_else(|| DecodeError::UnknownKind(tag.to_string()))?;

    InboundEvent::from_envelope(kind, envelope)
}

fn parse_fields<T: DeserializeOwned>(envelope: Map<String, Value>) -> serde_json::Result<T> {
    serde_json::from_value(Value::Object(envelope))
}

impl InboundEvent {
    fn from_envelope(kind: EventKind, envelope: Map<String, Value>) -> Result<Self, DecodeError> {
        let invalid = |source| DecodeError::InvalidEnvelope { kind, source };

        let event = match kind {
            EventKind::SendMessage => {
                let mut message: SendMessage = parse_fields(envelope.clone()).map_err(invalid)?;
                message.envelope = envelope;
                InboundEvent::SendMessage(message)
            }
            EventKind::DeliveredMessage => {
                InboundEvent::DeliveredMessage(parse_fields(envelope).map_err(invalid)?)
            }
            EventKind::ReadMessage => {
                InboundEvent::ReadMessage(parse_fields(envelope).map_err(invalid)?)
            }
            EventKind::Presence(presence) => {
                InboundEvent::Presence(presence, parse_fields(envelope).map_err(invalid)?)
            }
            EventKind::EditMessage => {
                InboundEvent::EditMessage(parse_fields(envelope).map_err(invalid)?)
            }
            EventKind::DeleteMessage => {
                InboundEvent::DeleteMessage(parse_fields(envelope).map_err(invalid)?)
            }
        };

        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            InboundEvent::SendMessage(_) => EventKind::SendMessage,
            InboundEvent::DeliveredMessage(_) => EventKind::DeliveredMessage,
            InboundEvent::ReadMessage(_) => EventKind::ReadMessage,
            InboundEvent::Presence(kind, _) => EventKind::Presence(*kind),
            InboundEvent::EditMessage(_) => EventKind::EditMessage,
            InboundEvent::DeleteMessage(_) => EventKind::DeleteMessage,
        }
    }

    pub fn conversation_id(&self) -> Option<&Id> {
        match self {
            InboundEvent::SendMessage(event) => Some(&event.conversation_id),
            InboundEvent::DeliveredMessage(event) => Some(&event.conversation_id),
            InboundEvent::ReadMessage(event) => Some(&event.conversation_id),
            InboundEvent::Presence(_, event) => Some(&event.conversation_id),
            InboundEvent::EditMessage(event) => event.conversation_id.as_ref(),
            InboundEvent::DeleteMessage(_) => None,
        }
    }

    /// The backend call that persists this event.
    ///
    /// `edit_message` and `delete_message` send the envelope's `message_id`.
    /// Older relays sent the message body in that field; the backend contract
    /// for these two routes still needs confirming.
    pub fn backend_request(&self) -> BackendRequest {
        match self {
            InboundEvent::SendMessage(event) => {
                let mut body = Map::from_iter([
                    ("message_id".to_string(), Value::from(&event.message_id)),
                    ("conversation_id".to_string(), Value::from(&event.conversation_id)),
                    ("message".to_string(), Value::from(event.message.as_str())),
                    ("sender_id".to_string(), Value::from(&event.sender_id)),
                ]);
                if let Some(time) = &event.time {
                    body.insert("time".to_string(), time.clone());
                }
                let parent_id = event.reply.as_ref().and_then(|reply| reply.get("id"));
                if let Some(parent_id) = parent_id {
                    body.insert("parent_id".to_string(), parent_id.clone());
                }
                if let Some(files) = &event.files {
                    body.insert("file".to_string(), files.clone());
                }
                BackendRequest::post(Route::Send, Value::Object(body))
            }
            InboundEvent::DeliveredMessage(event) => BackendRequest::post(
                Route::Delivered,
                json!({
                    "message_id": event.message_id,
                    "conversation_id": event.conversation_id,
                    "sender_id": event.sender_id,
                }),
            ),
            InboundEvent::ReadMessage(event) => BackendRequest::post(
                Route::ReadAll,
                json!({
                    "conversation_id": event.conversation_id,
                    "sender_id": event.sender_id,
                }),
            ),
            InboundEvent::Presence(_, event) => {
                BackendRequest::get(Route::Conversation(event.conversation_id.to_string()))
            }
            InboundEvent::EditMessage(event) => BackendRequest::post(
                Route::Update,
                json!({
                    "message": event.message,
                    "message_id": event.message_id,
                }),
            ),
            InboundEvent::DeleteMessage(event) => BackendRequest::post(
                Route::Delete,
                json!({ "message_id": event.message_id }),
            ),
        }
    }

    /// The payload re-broadcast to both participants of the conversation.
    pub fn outbound(&self, device_id: &str) -> OutboundEvent {
        let device_id = device_id.to_string();
        match self {
            InboundEvent::SendMessage(event) => {
                let mut envelope = event.envelope.clone();
                envelope.remove("type");
                envelope.insert("read".to_string(), Value::Bool(false));
                envelope.insert("deviceId".to_string(), Value::String(device_id));
                OutboundEvent::MessageSent(envelope)
            }
            InboundEvent::DeliveredMessage(event) => OutboundEvent::MessageDelivered {
                message_id: event.message_id.clone(),
                conversation_id: event.conversation_id.clone(),
                sender_id: event.sender_id.clone(),
                device_id,
            },
            InboundEvent::ReadMessage(event) => OutboundEvent::MessageRead {
                conversation_id: event.conversation_id.clone(),
                sender_id: event.sender_id.clone(),
                device_id,
            },
            InboundEvent::Presence(kind, event) => {
                let update = PresenceUpdate {
                    conversation_id: event.conversation_id.clone(),
                    sender_id: event.sender_id.clone(),
                    device_id,
                };
                match kind {
                    PresenceKind::Focus => OutboundEvent::Focus(update),
                    PresenceKind::ActiveTyping => OutboundEvent::ActiveTyping(update),
                    PresenceKind::IdleTyping => OutboundEvent::IdleTyping(update),
                    PresenceKind::Blur => OutboundEvent::Blur(update),
                }
            }
            InboundEvent::EditMessage(event) => OutboundEvent::EditMessage {
                message: event.message.clone(),
                message_id: event.message_id.clone(),
                conversation_id: event.conversation_id.clone(),
                sender_id: event.sender_id.clone(),
                device_id,
            },
            InboundEvent::DeleteMessage(event) => OutboundEvent::DeleteMessage {
                message_id: event.message_id.clone(),
                device_id,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceUpdate {
    pub conversation_id: Id,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<Id>,
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    #[serde(rename = "message_sent")]
    MessageSent(Map<String, Value>),
    #[serde(rename = "message_delivered")]
    MessageDelivered {
        message_id: Id,
        conversation_id: Id,
        sender_id: Id,
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    #[serde(rename = "message_read")]
    MessageRead {
        conversation_id: Id,
        sender_id: Id,
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    #[serde(rename = "focus")]
    Focus(PresenceUpdate),
    #[serde(rename = "active-typing")]
    ActiveTyping(PresenceUpdate),
    #[serde(rename = "idle-typing")]
    IdleTyping(PresenceUpdate),
    #[serde(rename = "blur")]
    Blur(PresenceUpdate),
    #[serde(rename = "edit_message")]
    EditMessage {
        message: String,
        message_id: Id,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Id>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_id: Option<Id>,
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    #[serde(rename = "delete_message")]
    DeleteMessage {
        message_id: Id,
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    /// Sent only to the originating connection when error frames are enabled.
    #[serde(rename = "error")]
    Error {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<String>,
    },
}

impl OutboundEvent {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
