//! Mapping between sessions and the frames carried by the message transport.
//!
//! Outbound frames are JSON objects with the encrypted payload and routing
//! ids. Inbound frames are parsed defensively: anything that is not a JSON
//! object with the expected fields is dropped, never an error.

use crate::directory::{optional_id, scalar_text};
use crate::{EncryptedPayload, Error, SessionConfig, SessionHeader, SessionRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// A frame as sent on the message transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub ciphertext: String,
    pub nonce: String,
    pub sender_device_id: String,
    pub receiver_device_id: String,
    pub header: Option<SessionHeader>,
    pub message_type: String,
}

/// A recognised inbound frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundFrame {
    Encrypted {
        id: Option<String>,
        sender_device_id: Option<String>,
        header: Option<SessionHeader>,
        payload: EncryptedPayload,
    },
    /// Carries encrypted fields that are not text, so it can never be
    /// decrypted.
    Unreadable {
        id: Option<String>,
        sender_device_id: Option<String>,
    },
    /// Sent by peers that predate encryption.
    Plaintext { id: Option<String>, content: String },
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default, deserialize_with = "optional_id")]
    id: Option<String>,
    #[serde(default)]
    ciphertext: Option<Value>,
    #[serde(default)]
    nonce: Option<Value>,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default, deserialize_with = "optional_id")]
    sender_device_id: Option<String>,
    #[serde(default)]
    header: Option<Value>,
}

/// Whether a field counts as set. Empty strings, zero, `false` and null
/// do not.
fn is_set(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64() != Some(0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

impl InboundFrame {
    /// Interprets an already-decoded JSON value.
    pub fn from_value(value: Value) -> Option<Self> {
        let raw: RawFrame = serde_json::from_value(value).ok()?;

        let ciphertext = raw.ciphertext.filter(is_set);
        let nonce = raw.nonce.filter(is_set);

        if let (Some(ciphertext), Some(nonce)) = (ciphertext, nonce) {
            return Some(match (ciphertext, nonce) {
                (Value::String(ciphertext), Value::String(nonce)) => Self::Encrypted {
                    id: raw.id,
                    sender_device_id: raw.sender_device_id,
                    header: raw.header.and_then(|header| serde_json::from_value(header).ok()),
                    payload: EncryptedPayload { ciphertext, nonce },
                },
                _ => Self::Unreadable {
                    id: raw.id,
                    sender_device_id: raw.sender_device_id,
                },
            });
        }

        raw.content
            .and_then(scalar_text)
            .filter(|content| !content.is_empty())
            .map(|content| Self::Plaintext {
                id: raw.id,
                content,
            })
    }
}

/// Parses a raw text frame, returning `None` for anything unrecognised.
pub fn parse_inbound(raw: &str) -> Option<InboundFrame> {
    let raw = raw.trim();
    if !raw.starts_with('{') {
        debug!("ignoring non-JSON frame");
        return None;
    }

    let frame = serde_json::from_str(raw).ok().and_then(InboundFrame::from_value);
    if frame.is_none() {
        debug!("ignoring unrecognised frame");
    }

    frame
}

/// How the content of a received message was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    Decrypted,
    Plaintext,
    /// The content is the undecryptable placeholder.
    Undecryptable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: Option<String>,
    pub sender_device_id: Option<String>,
    pub content: String,
    pub status: DeliveryStatus,
}

/// The outbound half of the message transport.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: String) -> Result<(), Error>;
}

#[async_trait]
impl<T: FrameSink + ?Sized> FrameSink for Arc<T> {
    async fn send_frame(&self, frame: String) -> Result<(), Error> {
        (**self).send_frame(frame).await
    }
}

/// An open conversation with one peer over an established session.
pub struct Conversation<S> {
    peer_id: String,
    local_device_id: String,
    session: SessionRecord,
    sink: S,
    config: SessionConfig,
}

impl<S: FrameSink> Conversation<S> {
    pub fn new(
        peer_id: &str,
        local_device_id: String,
        session: SessionRecord,
        sink: S,
        config: Option<SessionConfig>,
    ) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            local_device_id,
            session,
            sink,
            config: config.unwrap_or_default(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn session(&self) -> &SessionRecord {
        &self.session
    }

    /// Encrypts and sends `text`.
    ///
    /// Surrounding whitespace is trimmed; blank input sends nothing and
    /// returns `None`. The session header rides along on every frame.
    pub async fn send_text(&self, text: &str) -> Result<Option<OutboundFrame>, Error> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let payload = EncryptedPayload::seal(&self.session.session_key, text)?;
        let frame = OutboundFrame {
            ciphertext: payload.ciphertext,
            nonce: payload.nonce,
            sender_device_id: self.local_device_id.clone(),
            receiver_device_id: self.session.receiver_device_id.clone(),
            header: self.session.header.clone(),
            message_type: self.config.message_type.clone(),
        };

        self.sink.send_frame(serde_json::to_string(&frame)?).await?;
        debug!(peer_id = %self.peer_id, "sent encrypted frame");

        Ok(Some(frame))
    }

    fn undecryptable(&self, id: Option<String>, sender_device_id: Option<String>) -> ReceivedMessage {
        ReceivedMessage {
            id,
            sender_device_id,
            content: self.config.undecryptable_placeholder.clone(),
            status: DeliveryStatus::Undecryptable,
        }
    }

    fn open(&self, frame: InboundFrame) -> ReceivedMessage {
        match frame {
            InboundFrame::Encrypted {
                id,
                sender_device_id,
                payload,
                ..
            } => match payload.open(&self.session.session_key) {
                Ok(content) => ReceivedMessage {
                    id,
                    sender_device_id,
                    content,
                    status: DeliveryStatus::Decrypted,
                },
                Err(err) => {
                    warn!(peer_id = %self.peer_id, "undecryptable message: {err}");
                    self.undecryptable(id, sender_device_id)
                }
            },
            InboundFrame::Unreadable {
                id,
                sender_device_id,
            } => {
                warn!(peer_id = %self.peer_id, "encrypted fields are not text");
                self.undecryptable(id, sender_device_id)
            }
            InboundFrame::Plaintext { id, content } => ReceivedMessage {
                id,
                sender_device_id: None,
                content,
                status: DeliveryStatus::Plaintext,
            },
        }
    }

    /// Interprets a raw inbound frame. Unrecognised frames yield `None`; a
    /// frame that fails to decrypt yields the placeholder content.
    pub fn receive(&self, raw: &str) -> Option<ReceivedMessage> {
        parse_inbound(raw).map(|frame| self.open(frame))
    }

    /// Decrypts stored history. One bad entry never hides the rest: it
    /// becomes the placeholder, and entries with neither payload nor content
    /// become empty plaintext.
    pub fn decrypt_history(&self, messages: Vec<Value>) -> Vec<ReceivedMessage> {
        messages
            .into_iter()
            .map(|message| {
                let id = message.get("id").cloned().and_then(scalar_text);

                match InboundFrame::from_value(message) {
                    Some(frame) => self.open(frame),
                    None => ReceivedMessage {
                        id,
                        sender_device_id: None,
                        content: String::new(),
                        status: DeliveryStatus::Plaintext,
                    },
                }
            })
            .collect()
    }
}
