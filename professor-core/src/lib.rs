//! # professor-core
//!
//! Real-time voice session core: stream the microphone to a remote
//! conversational-audio service and play its spoken replies back gaplessly.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → InputStream → SPSC RingBuffer → CapturePipeline (16 kHz, 4096-sample frames)
//!                                                    │ encode (base64 i16 LE)
//!                                                    ▼
//!            ┌──────────────────── session event queue ◄── TransportCallbacks
//!            │                                       ▲
//!            ▼                                       └── PlaybackEnded / DeviceFailed
//!     SessionController ──► Transport::send
//!            │
//!            ├─ decode reply chunk ──► PlaybackScheduler ──► AudioOutput (24 kHz)
//!            └─ status ──► broadcast::Sender<SessionStatusEvent>
//! ```
//!
//! The audio callbacks are zero-alloc. Encoding and decoding happen off the
//! device threads; every state change happens on the session worker.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod transport;

// Convenience re-exports for downstream crates
pub use audio::{AudioBackend, CpalBackend};
pub use config::SessionConfig;
pub use engine::{DiagnosticsSnapshot, LiveSession, SessionController, SessionRequest};
pub use error::ProfessorError;
pub use ipc::events::{SessionState, SessionStatusEvent};
pub use playback::{AudioOutput, PlaybackScheduler};
pub use transport::{Attachment, ConnectOptions, ServerMessage, Transport};
