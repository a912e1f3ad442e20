//! Inbound events of the controller's single event queue.
//!
//! Transport callbacks, end-of-playback notifications from the output
//! device, device failures and encoded capture frames all arrive here.
//! Every event is stamped with the session generation it belongs to; the
//! controller discards events from a generation it has already torn down.

use crossbeam_channel::Sender;

use crate::capture::ChunkSink;
use crate::codec::EncodedChunk;
use crate::error::{ProfessorError, Result};
use crate::playback::SourceId;
use crate::transport::ServerMessage;

#[derive(Debug)]
pub struct SessionEvent {
    pub generation: u64,
    pub kind: EventKind,
}

#[derive(Debug)]
pub enum EventKind {
    /// Remote session is open.
    Opened,
    /// Remote message: optional audio plus optional interruption flag.
    Message(ServerMessage),
    /// Remote session closed.
    Closed { reason: Option<String> },
    /// Remote session failed.
    Errored(String),
    /// A scheduled source finished playing on the output device.
    PlaybackEnded(SourceId),
    /// One encoded capture frame, ready to forward.
    CaptureFrame(EncodedChunk),
    /// Input or output device reported a stream error.
    DeviceFailed(String),
}

/// Cloneable handle used by collaborators to post into the event queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    generation: u64,
    tx: Sender<SessionEvent>,
}

impl EventSender {
    pub fn new(generation: u64, tx: Sender<SessionEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Post an event. Returns `false` once the queue's receiver is gone.
    pub fn emit(&self, kind: EventKind) -> bool {
        self.tx
            .send(SessionEvent {
                generation: self.generation,
                kind,
            })
            .is_ok()
    }

    pub fn playback_ended(&self, source: SourceId) {
        self.emit(EventKind::PlaybackEnded(source));
    }

    pub fn device_failed(&self, message: impl Into<String>) {
        self.emit(EventKind::DeviceFailed(message.into()));
    }
}

impl ChunkSink for EventSender {
    fn deliver(&mut self, chunk: EncodedChunk) -> Result<()> {
        if self.emit(EventKind::CaptureFrame(chunk)) {
            Ok(())
        } else {
            Err(ProfessorError::SessionGone)
        }
    }
}
