//! `LiveSession`: thread-owning handle around the session controller.
//!
//! ## Lifecycle
//!
//! ```text
//! LiveSession::spawn()
//!     └─► start_session()    → devices acquired, status = Connecting → Listening
//!         ├─► (replies)      → Speaking ⇄ Listening
//!         ├─► retry()        → only from Error / Closed, full teardown + reconnect
//!         └─► end_session()  → teardown, status = Closed
//! drop(LiveSession)          → worker shuts down, teardown runs on the worker
//! ```
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread affinity).
//! The backend is therefore moved into the worker thread and every stream is
//! opened and dropped there. Commands and device/transport events meet in one
//! `crossbeam_channel::select!` loop, so the controller never sees two
//! reactions at once.

pub mod controller;
pub mod events;

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    audio::{AudioBackend, CpalBackend},
    config::SessionConfig,
    error::{ProfessorError, Result},
    ipc::events::{SessionState, SessionStatusEvent},
    transport::{Attachment, Transport},
};

pub use controller::{
    DiagnosticsSnapshot, SessionController, SessionDiagnostics, SessionRequest, StatusPublisher,
};
pub use events::{EventKind, EventSender, SessionEvent};

/// Broadcast channel capacity: status events buffered for slow consumers.
const BROADCAST_CAP: usize = 64;

enum Command {
    Start(SessionRequest),
    End,
    Retry,
    Shutdown,
}

/// The public handle.
///
/// `LiveSession` is `Send + Sync`; methods only post commands or read shared
/// snapshots, so they never block on device or network work.
pub struct LiveSession {
    commands: Sender<Command>,
    status: StatusPublisher,
    diagnostics: Arc<SessionDiagnostics>,
    worker: Option<JoinHandle<()>>,
}

impl LiveSession {
    /// Spawn the session worker. No device is touched until `start_session`.
    pub fn spawn<B, T>(config: SessionConfig, backend: B, transport: T) -> Result<Self>
    where
        B: AudioBackend,
        T: Transport,
    {
        let (commands, command_rx) = crossbeam_channel::unbounded();
        let status = StatusPublisher::new(BROADCAST_CAP);
        let diagnostics = Arc::new(SessionDiagnostics::default());

        let worker_status = status.clone();
        let worker_diagnostics = Arc::clone(&diagnostics);
        let worker = std::thread::Builder::new()
            .name("professor-session".into())
            .spawn(move || {
                let (event_tx, event_rx) = crossbeam_channel::unbounded();
                let mut controller = SessionController::new(
                    config,
                    Box::new(backend),
                    Box::new(transport),
                    event_tx,
                    worker_status,
                    worker_diagnostics,
                );
                run_worker(&mut controller, &command_rx, &event_rx);
                controller.teardown();
                info!("session worker stopped");
            })?;

        Ok(Self {
            commands,
            status,
            diagnostics,
            worker: Some(worker),
        })
    }

    /// Spawn with the system microphone and speakers from the config's
    /// device preferences.
    pub fn with_system_audio<T: Transport>(config: SessionConfig, transport: T) -> Result<Self> {
        let backend = CpalBackend::new(
            config.preferred_input_device.clone(),
            config.preferred_output_device.clone(),
        );
        Self::spawn(config, backend, transport)
    }

    /// Begin a session about `context`. Any live session is torn down first.
    pub fn start_session(
        &self,
        context: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<()> {
        self.send(Command::Start(SessionRequest::new(context, attachments)))
    }

    pub fn end_session(&self) -> Result<()> {
        self.send(Command::End)
    }

    /// Reconnect with the last request. Ignored unless in `error` or `closed`.
    pub fn retry(&self) -> Result<()> {
        self.send(Command::Retry)
    }

    pub fn state(&self) -> SessionState {
        self.status.snapshot().state
    }

    /// Error message while in `error`.
    pub fn error(&self) -> Option<String> {
        let status = self.status.snapshot();
        match status.state {
            SessionState::Error => status.detail,
            _ => None,
        }
    }

    pub fn status(&self) -> SessionStatusEvent {
        self.status.snapshot()
    }

    /// Subscribe to live status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status.subscribe()
    }

    /// Snapshot of session counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ProfessorError::SessionGone)
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("session worker panicked");
            }
        }
    }
}

fn run_worker(
    controller: &mut SessionController,
    commands: &Receiver<Command>,
    events: &Receiver<SessionEvent>,
) {
    loop {
        crossbeam_channel::select! {
            recv(commands) -> command => match command {
                Ok(Command::Start(request)) => controller.start(request),
                Ok(Command::End) => controller.end(),
                Ok(Command::Retry) => controller.retry(),
                Ok(Command::Shutdown) | Err(_) => break,
            },
            recv(events) -> event => {
                if let Ok(event) = event {
                    controller.handle_event(event);
                }
            }
        }
    }
}
