//! Session lifecycle state machine.
//!
//! ## States
//!
//! ```text
//!            start()                 Opened
//!   idle ─────────────► connecting ───────────► listening ◄────────┐
//!                           │                     │    ▲           │ drained /
//!                           │            reply    │    │ interrupt │ interrupt
//!                           │            chunk    ▼    │           │
//!                           │                    speaking ─────────┘
//!                           ▼
//!   any state ── Errored / device failure ──► error ── retry() ──► connecting
//!   any state ── Closed / end() ────────────► closed ── retry() ──► connecting
//! ```
//!
//! `SessionController` is synchronous: it is driven by `start / end / retry`
//! and by `handle_event` for every item of the session event queue. Exactly
//! one thread drives it (the `LiveSession` worker, or a test), so reactions
//! never interleave.
//!
//! ## Resource pairing
//!
//! | acquired in            | released in `teardown()`          |
//! |------------------------|-----------------------------------|
//! | `open_output`          | `PlaybackScheduler::shutdown`     |
//! | `open_input`           | `InputStream::close`              |
//! | `Transport::connect`   | `Transport::close`                |
//! | `CapturePipeline::start` (on open) | `CapturePipeline::stop` |

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{AudioBackend, InputStream},
    buffering::{create_audio_ring, AudioConsumer},
    capture::CapturePipeline,
    codec::{self, EncodedChunk, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE},
    config::SessionConfig,
    engine::events::{EventKind, EventSender, SessionEvent},
    error::{ProfessorError, Result},
    ipc::events::{SessionState, SessionStatusEvent},
    playback::{PlaybackScheduler, PlaybackStatus, SourceId},
    transport::{Attachment, OutboundMessage, ServerMessage, Transport, TransportCallbacks},
};

/// What the user asked to talk about. Kept for `retry`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRequest {
    /// Description of the studied material, folded into the system instruction.
    pub context: String,
    /// Sent once per session right after the remote side opens.
    pub attachments: Vec<Attachment>,
}

impl SessionRequest {
    pub fn new(context: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            context: context.into(),
            attachments,
        }
    }
}

#[derive(Default)]
pub struct SessionDiagnostics {
    pub chunks_sent: AtomicUsize,
    /// Decoded PCM bytes carried by the sent chunks.
    pub pcm_bytes_sent: AtomicUsize,
    pub chunks_received: AtomicUsize,
    pub buffers_scheduled: AtomicUsize,
    pub malformed_dropped: AtomicUsize,
    pub interruptions: AtomicUsize,
    pub stale_events: AtomicUsize,
    pub teardowns: AtomicUsize,
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        self.chunks_sent.store(0, Ordering::Relaxed);
        self.pcm_bytes_sent.store(0, Ordering::Relaxed);
        self.chunks_received.store(0, Ordering::Relaxed);
        self.buffers_scheduled.store(0, Ordering::Relaxed);
        self.malformed_dropped.store(0, Ordering::Relaxed);
        self.interruptions.store(0, Ordering::Relaxed);
        self.stale_events.store(0, Ordering::Relaxed);
        self.teardowns.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            pcm_bytes_sent: self.pcm_bytes_sent.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            buffers_scheduled: self.buffers_scheduled.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            stale_events: self.stale_events.load(Ordering::Relaxed),
            teardowns: self.teardowns.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub chunks_sent: usize,
    pub pcm_bytes_sent: usize,
    pub chunks_received: usize,
    pub buffers_scheduled: usize,
    pub malformed_dropped: usize,
    pub interruptions: usize,
    pub stale_events: usize,
    pub teardowns: usize,
}

/// Latest status plus a broadcast of every change.
#[derive(Clone)]
pub struct StatusPublisher {
    current: Arc<Mutex<SessionStatusEvent>>,
    tx: broadcast::Sender<SessionStatusEvent>,
}

impl StatusPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            current: Arc::new(Mutex::new(SessionStatusEvent::default())),
            tx,
        }
    }

    pub fn publish(&self, event: SessionStatusEvent) {
        *self.current.lock() = event.clone();
        let _ = self.tx.send(event);
    }

    pub fn snapshot(&self) -> SessionStatusEvent {
        self.current.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.tx.subscribe()
    }
}

pub struct SessionController {
    config: SessionConfig,
    backend: Box<dyn AudioBackend>,
    transport: Box<dyn Transport>,
    events_tx: Sender<SessionEvent>,
    status: StatusPublisher,
    diagnostics: Arc<SessionDiagnostics>,

    state: SessionState,
    generation: u64,
    request: Option<SessionRequest>,
    context_sent: bool,

    input: Option<Box<dyn InputStream>>,
    /// Consumer half of the capture ring, parked until the session opens.
    pending_capture: Option<AudioConsumer>,
    capture: CapturePipeline,
    scheduler: Option<PlaybackScheduler>,
    transport_open: bool,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        backend: Box<dyn AudioBackend>,
        transport: Box<dyn Transport>,
        events_tx: Sender<SessionEvent>,
        status: StatusPublisher,
        diagnostics: Arc<SessionDiagnostics>,
    ) -> Self {
        Self {
            config,
            backend,
            transport,
            events_tx,
            status,
            diagnostics,
            state: SessionState::Idle,
            generation: 0,
            request: None,
            context_sent: false,
            input: None,
            pending_capture: None,
            capture: CapturePipeline::new(),
            scheduler: None,
            transport_open: false,
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────

    /// Tear down whatever is live, then acquire devices and open a new session.
    pub fn start(&mut self, request: SessionRequest) {
        if self.teardown() {
            info!(generation = self.generation, "previous session torn down before start");
        }

        self.generation += 1;
        self.context_sent = false;
        self.request = Some(request);
        self.set_state(SessionState::Connecting, None);

        let events = EventSender::new(self.generation, self.events_tx.clone());
        if let Err(e) = self.acquire(events) {
            self.fail(e);
        }
    }

    /// User exit. Always tears down.
    pub fn end(&mut self) {
        let was = self.state;
        self.teardown();
        if !matches!(was, SessionState::Idle | SessionState::Closed) {
            self.set_state(SessionState::Closed, None);
        }
    }

    /// Full teardown and reconnect with the last request. Only from
    /// `error` or `closed`.
    pub fn retry(&mut self) {
        if !self.state.can_retry() {
            warn!(state = ?self.state, "retry ignored");
            return;
        }
        let Some(request) = self.request.clone() else {
            warn!("retry ignored: no session was ever started");
            return;
        };
        info!(generation = self.generation, "retrying session");
        self.start(request);
    }

    // ── Events ───────────────────────────────────────────────────────────

    pub fn handle_event(&mut self, event: SessionEvent) {
        if event.generation != self.generation || !self.accepts_events() {
            SessionDiagnostics::bump(&self.diagnostics.stale_events);
            debug!(
                event_generation = event.generation,
                generation = self.generation,
                state = ?self.state,
                "dropping stale event"
            );
            return;
        }

        match event.kind {
            EventKind::Opened => self.on_opened(),
            EventKind::Message(message) => self.on_message(message),
            EventKind::Closed { reason } => self.on_remote_closed(reason),
            EventKind::Errored(message) => self.fail(ProfessorError::Transport(message)),
            EventKind::PlaybackEnded(source) => self.on_playback_ended(source),
            EventKind::CaptureFrame(chunk) => self.on_capture_frame(chunk),
            EventKind::DeviceFailed(message) => {
                self.fail(ProfessorError::DeviceAcquisition(message))
            }
        }
    }

    /// Handle everything currently queued. Returns how many events were handled.
    pub fn pump(&mut self, rx: &Receiver<SessionEvent>) -> usize {
        let mut handled = 0;
        while let Ok(event) = rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Release every session resource. Safe to call repeatedly; returns
    /// `true` only when something was actually released.
    pub fn teardown(&mut self) -> bool {
        let mut released = self.capture.stop();
        released |= self.pending_capture.take().is_some();

        if let Some(mut input) = self.input.take() {
            input.close();
            released = true;
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.shutdown();
            released = true;
        }
        if self.transport_open {
            self.transport_open = false;
            self.transport.close();
            released = true;
        }

        if released {
            SessionDiagnostics::bump(&self.diagnostics.teardowns);
            info!(generation = self.generation, "session resources released");
        }
        released
    }

    // ── Observers ────────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Error message while in `error`.
    pub fn error(&self) -> Option<String> {
        if self.state != SessionState::Error {
            return None;
        }
        self.status.snapshot().detail
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Buffers scheduled or playing right now.
    pub fn active_playback(&self) -> usize {
        self.scheduler
            .as_ref()
            .map(PlaybackScheduler::active_len)
            .unwrap_or(0)
    }

    pub fn diagnostics(&self) -> &Arc<SessionDiagnostics> {
        &self.diagnostics
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn accepts_events(&self) -> bool {
        matches!(
            self.state,
            SessionState::Connecting | SessionState::Listening | SessionState::Speaking
        )
    }

    fn acquire(&mut self, events: EventSender) -> Result<()> {
        let output = self.backend.open_output(events.clone())?;
        self.scheduler = Some(PlaybackScheduler::new(output));

        let (producer, consumer) = create_audio_ring();
        let input = self.backend.open_input(producer, events.clone())?;
        self.input = Some(input);
        self.pending_capture = Some(consumer);

        let context = self
            .request
            .as_ref()
            .map(|r| r.context.as_str())
            .unwrap_or_default();
        let options = self.config.connect_options(context);
        self.transport
            .connect(&options, TransportCallbacks::new(events))?;
        self.transport_open = true;

        info!(
            generation = self.generation,
            model = %options.model,
            voice = %options.voice,
            "devices acquired, session connecting"
        );
        Ok(())
    }

    fn on_opened(&mut self) {
        if self.state != SessionState::Connecting {
            debug!(state = ?self.state, "ignoring repeated open");
            return;
        }
        let Some(consumer) = self.pending_capture.take() else {
            self.fail(ProfessorError::AudioStream("capture stream missing at open".into()));
            return;
        };
        let capture_rate = self
            .input
            .as_ref()
            .map(|i| i.sample_rate())
            .unwrap_or(INPUT_SAMPLE_RATE);

        let sink = EventSender::new(self.generation, self.events_tx.clone());
        if let Err(e) = self.capture.start(consumer, capture_rate, sink) {
            self.fail(e);
            return;
        }
        if let Err(e) = self.send_context() {
            self.fail(e);
            return;
        }
        self.set_state(SessionState::Listening, None);
    }

    fn send_context(&mut self) -> Result<()> {
        if self.context_sent {
            return Ok(());
        }
        let attachments = self
            .request
            .as_ref()
            .map(|r| r.attachments.clone())
            .unwrap_or_default();
        let count = attachments.len();

        for attachment in attachments {
            self.transport.send(OutboundMessage::Attachment(attachment))?;
        }
        self.transport.send(OutboundMessage::Text {
            text: self.config.ready_prompt.clone(),
        })?;
        self.context_sent = true;
        info!(attachments = count, "session context sent");
        Ok(())
    }

    fn on_message(&mut self, message: ServerMessage) {
        if !self.state.is_live() {
            SessionDiagnostics::bump(&self.diagnostics.stale_events);
            debug!(state = ?self.state, "dropping message received before open");
            return;
        }

        // Barge-in cuts what is playing; audio in the same message is new speech.
        if message.interrupted {
            SessionDiagnostics::bump(&self.diagnostics.interruptions);
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.interrupt();
            }
            if self.state == SessionState::Speaking {
                self.set_state(SessionState::Listening, None);
            }
        }

        let Some(data) = message.audio else {
            return;
        };
        SessionDiagnostics::bump(&self.diagnostics.chunks_received);

        let buffer = match codec::decode(&data, OUTPUT_SAMPLE_RATE) {
            Ok(buffer) => buffer,
            Err(e) => {
                SessionDiagnostics::bump(&self.diagnostics.malformed_dropped);
                warn!(generation = self.generation, "dropping reply chunk: {e}");
                return;
            }
        };

        let scheduled = match self.scheduler.as_mut() {
            Some(scheduler) => scheduler.enqueue(buffer),
            None => return,
        };
        match scheduled {
            Ok(Some(_)) => {
                SessionDiagnostics::bump(&self.diagnostics.buffers_scheduled);
                if self.state == SessionState::Listening {
                    self.set_state(SessionState::Speaking, None);
                }
            }
            Ok(None) => {}
            Err(e) => self.fail(e),
        }
    }

    fn on_playback_ended(&mut self, source: SourceId) {
        let status = self
            .scheduler
            .as_mut()
            .map(|s| s.source_ended(source))
            .unwrap_or(PlaybackStatus::Ignored);

        if status == PlaybackStatus::Drained && self.state == SessionState::Speaking {
            self.set_state(SessionState::Listening, None);
        }
    }

    fn on_capture_frame(&mut self, chunk: EncodedChunk) {
        if !self.state.is_live() {
            return;
        }
        let bytes = chunk.pcm_len();
        match self.transport.send(OutboundMessage::Audio(chunk)) {
            Ok(()) => {
                SessionDiagnostics::bump(&self.diagnostics.chunks_sent);
                self.diagnostics
                    .pcm_bytes_sent
                    .fetch_add(bytes, Ordering::Relaxed);
                debug!(generation = self.generation, bytes, "capture frame sent");
            }
            Err(e) => self.fail(e),
        }
    }

    fn on_remote_closed(&mut self, reason: Option<String>) {
        info!(generation = self.generation, reason = ?reason, "remote session closed");
        self.teardown();
        self.set_state(SessionState::Closed, reason);
    }

    fn fail(&mut self, err: ProfessorError) {
        if err.is_device_failure() {
            error!(generation = self.generation, "audio device failure: {err}");
        } else {
            error!(generation = self.generation, "session failed: {err}");
        }
        self.teardown();
        self.set_state(SessionState::Error, Some(err.to_string()));
    }

    fn set_state(&mut self, state: SessionState, detail: Option<String>) {
        if self.state != state {
            info!(from = ?self.state, to = ?state, generation = self.generation, "session state");
        }
        self.state = state;
        self.status.publish(SessionStatusEvent {
            state,
            detail,
            generation: self.generation,
        });
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.teardown();
    }
}
