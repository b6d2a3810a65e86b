//! Wire protocol for the `/ws` channel.
//!
//! Every frame is a JSON object `{"type": <string>, "data": <object>}`.
//! Inbound frames are decoded through a dispatch on the `type` tag so that
//! unknown types and bad payloads can be told apart from unparseable JSON;
//! outbound frames serialize from a closed enum.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Generate an opaque, URL-safe random identifier (128 bits).
///
/// Used for session ids, room ids, and message ids.
pub fn new_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

// ---------------------------------------------------------------------------
// Inbound (client -> server)
// ---------------------------------------------------------------------------

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    JoinQueue,
    LeaveQueue,
    SendMessage { content: String },
    Typing,
    StopTyping,
    DisconnectChat,
    SendMedia {
        url: String,
        kind: String,
        name: Option<String>,
        size: Option<u64>,
    },
}

/// Why an inbound frame could not be turned into a [`ClientEvent`].
#[derive(Debug)]
pub enum FrameError {
    /// The text was not a JSON object with a string `type` field.
    Malformed(serde_json::Error),
    /// The `type` tag is not part of the protocol.
    UnknownType(String),
    /// The tag was recognised but `data` did not match its payload shape.
    BadPayload(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Malformed(e) => write!(f, "malformed frame: {e}"),
            FrameError::UnknownType(t) => write!(f, "unknown frame type: {t}"),
            FrameError::BadPayload(t) => write!(f, "bad payload for frame type: {t}"),
        }
    }
}

impl std::error::Error for FrameError {}

#[derive(Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct MessagePayload {
    content: String,
}

#[derive(Deserialize)]
struct MediaPayload {
    url: String,
    kind: String,
    name: Option<String>,
    size: Option<u64>,
}

/// Decode one inbound frame.
pub fn parse_client_frame(text: &str) -> Result<ClientEvent, FrameError> {
    let frame: InboundFrame = serde_json::from_str(text).map_err(FrameError::Malformed)?;
    match frame.kind.as_str() {
        "join_queue" => Ok(ClientEvent::JoinQueue),
        "leave_queue" => Ok(ClientEvent::LeaveQueue),
        "typing" => Ok(ClientEvent::Typing),
        "stop_typing" => Ok(ClientEvent::StopTyping),
        "disconnect_chat" => Ok(ClientEvent::DisconnectChat),
        "send_message" => {
            let p: MessagePayload = serde_json::from_value(frame.data)
                .map_err(|_| FrameError::BadPayload(frame.kind))?;
            Ok(ClientEvent::SendMessage { content: p.content })
        }
        "send_media" => {
            let p: MediaPayload = serde_json::from_value(frame.data)
                .map_err(|_| FrameError::BadPayload(frame.kind))?;
            Ok(ClientEvent::SendMedia {
                url: p.url,
                kind: p.kind,
                name: p.name,
                size: p.size,
            })
        }
        _ => Err(FrameError::UnknownType(frame.kind)),
    }
}

// ---------------------------------------------------------------------------
// Outbound (server -> client)
// ---------------------------------------------------------------------------

/// Message kind carried in a relayed [`ChatMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    System,
}

/// Media kind accepted over `send_media`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Parse the wire string; `None` for anything outside {image, video}.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// The message object relayed to a partner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub sender_id: String,
    /// Milliseconds since UNIX epoch.
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_kind: Option<MediaKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

impl ChatMessage {
    /// A plain user text message.
    pub fn text(sender_id: &str, content: String, timestamp: u64) -> Self {
        Self {
            id: new_id(),
            content,
            sender_id: sender_id.to_string(),
            timestamp,
            kind: MessageKind::User,
            media_url: None,
            media_kind: None,
            file_name: None,
            file_size: None,
        }
    }

    /// A media reference message.
    pub fn media(
        sender_id: &str,
        url: String,
        kind: MediaKind,
        name: Option<String>,
        size: Option<u64>,
        timestamp: u64,
    ) -> Self {
        Self {
            id: new_id(),
            content: String::new(),
            sender_id: sender_id.to_string(),
            timestamp,
            kind: MessageKind::User,
            media_url: Some(url),
            media_kind: Some(kind),
            file_name: name,
            file_size: size,
        }
    }
}

/// Frames the server may send.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    QueueJoined {},
    PartnerFound {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    MessageReceived {
        message: ChatMessage,
    },
    MediaReceived {
        message: ChatMessage,
    },
    PartnerTyping {},
    PartnerStoppedTyping {},
    PartnerDisconnected {},
    Banned {},
    Error {
        message: String,
    },
    RateLimited {
        message: String,
    },
    MessageFlagged {
        message: String,
    },
}

/// Serialize an outbound frame to its wire form.
pub fn encode(event: &ServerEvent) -> String {
    serde_json::to_string(event).expect("server event serializes")
}
