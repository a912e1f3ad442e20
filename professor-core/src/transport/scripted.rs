//! `ScriptedTransport`: in-process transport driven by a [`RemoteControl`].
//!
//! Nothing goes over the network. `RemoteControl` plays the remote side: it fires
//! open/message/close/error callbacks on demand and records everything the
//! controller sent. Used by the tests and by the `session-replay` tool.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::codec;
use crate::error::{ProfessorError, Result};
use crate::transport::{
    ConnectOptions, OutboundMessage, ServerMessage, Transport, TransportCallbacks,
};

#[derive(Default)]
struct Ledger {
    callbacks: Option<TransportCallbacks>,
    connects: usize,
    closes: usize,
    sent: Vec<OutboundMessage>,
    last_options: Option<ConnectOptions>,
    fail_next_connect: Option<String>,
    fail_sends: Option<String>,
    auto_open: bool,
}

pub struct ScriptedTransport {
    ledger: Arc<Mutex<Ledger>>,
}

/// Remote-side handle for a [`ScriptedTransport`].
#[derive(Clone)]
pub struct RemoteControl {
    ledger: Arc<Mutex<Ledger>>,
}

impl ScriptedTransport {
    pub fn new() -> (Self, RemoteControl) {
        let ledger = Arc::new(Mutex::new(Ledger::default()));
        (
            Self {
                ledger: Arc::clone(&ledger),
            },
            RemoteControl { ledger },
        )
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self, options: &ConnectOptions, callbacks: TransportCallbacks) -> Result<()> {
        let mut ledger = self.ledger.lock();
        ledger.connects += 1;
        ledger.last_options = Some(options.clone());
        if let Some(reason) = ledger.fail_next_connect.take() {
            return Err(ProfessorError::Transport(reason));
        }
        if ledger.auto_open {
            callbacks.opened();
        }
        ledger.callbacks = Some(callbacks);
        debug!(model = %options.model, "scripted transport connected");
        Ok(())
    }

    fn send(&mut self, message: OutboundMessage) -> Result<()> {
        let mut ledger = self.ledger.lock();
        if let Some(reason) = ledger.fail_sends.clone() {
            return Err(ProfessorError::Transport(reason));
        }
        ledger.sent.push(message);
        Ok(())
    }

    fn close(&mut self) {
        let mut ledger = self.ledger.lock();
        if ledger.callbacks.take().is_some() {
            ledger.closes += 1;
        }
    }
}

impl RemoteControl {
    fn callbacks(&self) -> Option<TransportCallbacks> {
        self.ledger.lock().callbacks.clone()
    }

    /// Fire `opened` immediately on every future `connect`.
    pub fn set_auto_open(&self, enabled: bool) {
        self.ledger.lock().auto_open = enabled;
    }

    /// Make the next `connect` fail with a transport error.
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        self.ledger.lock().fail_next_connect = Some(reason.into());
    }

    /// Make every `send` fail until cleared with `None`.
    pub fn fail_sends(&self, reason: Option<String>) {
        self.ledger.lock().fail_sends = reason;
    }

    /// Returns `false` when no session is connected.
    pub fn open(&self) -> bool {
        self.callbacks().map(|cb| cb.opened()).is_some()
    }

    pub fn deliver(&self, message: ServerMessage) -> bool {
        self.callbacks().map(|cb| cb.message(message)).is_some()
    }

    /// Deliver spoken audio, encoding `samples` as a 24 kHz reply chunk.
    pub fn deliver_speech(&self, samples: &[f32]) -> bool {
        self.deliver(ServerMessage::audio(codec::encode(samples).data))
    }

    pub fn interrupt(&self) -> bool {
        self.deliver(ServerMessage::interruption())
    }

    pub fn close_remote(&self, reason: Option<&str>) -> bool {
        self.callbacks()
            .map(|cb| cb.closed(reason.map(str::to_string)))
            .is_some()
    }

    pub fn fail(&self, message: &str) -> bool {
        self.callbacks().map(|cb| cb.errored(message)).is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.ledger.lock().callbacks.is_some()
    }

    pub fn connects(&self) -> usize {
        self.ledger.lock().connects
    }

    pub fn closes(&self) -> usize {
        self.ledger.lock().closes
    }

    pub fn last_options(&self) -> Option<ConnectOptions> {
        self.ledger.lock().last_options.clone()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.ledger.lock().sent.clone()
    }

    pub fn sent_audio_count(&self) -> usize {
        self.ledger
            .lock()
            .sent
            .iter()
            .filter(|m| matches!(m, OutboundMessage::Audio(_)))
            .count()
    }
}
