//! Remote session abstraction.
//!
//! The `Transport` trait decouples the controller from any concrete
//! streaming backend. A transport reports what happens on the wire through
//! [`TransportCallbacks`], which post into the controller's event queue, so
//! the controller can be driven by a scripted fake exactly as by a real
//! connection.

pub mod scripted;

pub use scripted::{RemoteControl, ScriptedTransport};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::codec::{input_mime_type, EncodedChunk, OUTPUT_SAMPLE_RATE};
use crate::engine::events::{EventKind, EventSender};
use crate::error::Result;

/// Parameters handed to the transport when opening a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOptions {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    /// MIME tag of the audio this side will send.
    pub input_mime_type: String,
    /// Rate the remote side must use for spoken replies.
    pub output_sample_rate: u32,
}

impl ConnectOptions {
    pub fn new(
        model: impl Into<String>,
        voice: impl Into<String>,
        system_instruction: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            voice: voice.into(),
            system_instruction: system_instruction.into(),
            input_mime_type: input_mime_type(),
            output_sample_rate: OUTPUT_SAMPLE_RATE,
        }
    }
}

/// Contextual material (e.g. uploaded book pages) sent once per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub mime_type: String,
    /// base64 payload.
    pub data: String,
}

impl Attachment {
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: STANDARD.encode(bytes),
        }
    }
}

/// One inbound message: at most one audio chunk plus an optional
/// interruption flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerMessage {
    /// base64 of 24 kHz i16 LE PCM.
    pub audio: Option<String>,
    /// The user started speaking over the assistant (barge-in).
    pub interrupted: bool,
}

impl ServerMessage {
    pub fn audio(data: impl Into<String>) -> Self {
        Self {
            audio: Some(data.into()),
            interrupted: false,
        }
    }

    pub fn interruption() -> Self {
        Self {
            audio: None,
            interrupted: true,
        }
    }
}

/// Everything the controller sends over the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundMessage {
    Audio(EncodedChunk),
    Attachment(Attachment),
    Text { text: String },
}

/// Contract for remote streaming sessions.
///
/// `connect` only initiates the session; success is reported later through
/// `TransportCallbacks::opened`. Callbacks may fire from any thread.
pub trait Transport: Send + 'static {
    /// Begin opening a session.
    ///
    /// # Errors
    /// Returns `ProfessorError::Transport` when the session cannot be initiated.
    fn connect(&mut self, options: &ConnectOptions, callbacks: TransportCallbacks) -> Result<()>;

    /// Send one message on the open session.
    fn send(&mut self, message: OutboundMessage) -> Result<()>;

    /// Release the session handle. Must tolerate being called when not connected.
    fn close(&mut self);
}

/// The four hooks a transport reports through.
#[derive(Debug, Clone)]
pub struct TransportCallbacks(EventSender);

impl TransportCallbacks {
    pub fn new(events: EventSender) -> Self {
        Self(events)
    }

    pub fn opened(&self) {
        self.0.emit(EventKind::Opened);
    }

    pub fn message(&self, message: ServerMessage) {
        self.0.emit(EventKind::Message(message));
    }

    pub fn closed(&self, reason: Option<String>) {
        self.0.emit(EventKind::Closed { reason });
    }

    pub fn errored(&self, message: impl Into<String>) {
        self.0.emit(EventKind::Errored(message.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_message_tolerates_missing_fields() {
        let msg: ServerMessage = serde_json::from_str(r#"{"interrupted":true}"#).unwrap();
        assert_eq!(msg, ServerMessage::interruption());

        let msg: ServerMessage = serde_json::from_str(r#"{"audio":"AAA="}"#).unwrap();
        assert_eq!(msg.audio.as_deref(), Some("AAA="));
        assert!(!msg.interrupted);
    }

    #[test]
    fn outbound_text_serializes_with_type_tag() {
        let json = serde_json::to_value(OutboundMessage::Text {
            text: "ready".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "ready");
    }

    #[test]
    fn attachment_base64_encodes_bytes() {
        let att = Attachment::from_bytes("image/png", &[0x89, b'P', b'N', b'G']);
        assert_eq!(att.data, "iVBORw==");
        assert_eq!(att.mime_type, "image/png");
    }

    #[test]
    fn connect_options_pin_wire_formats() {
        let opts = ConnectOptions::new("model-x", "Puck", "teach");
        assert_eq!(opts.input_mime_type, "audio/pcm;rate=16000");
        assert_eq!(opts.output_sample_rate, 24_000);
    }
}
