//! Replays a scripted conversation against virtual devices.
//!
//! ```text
//! session-replay --script demo.json [--config session.json] [--wav-out reply.wav] [--tail-ms 1000]
//! ```
//!
//! The script is a JSON object:
//!
//! ```json
//! {
//!   "context": "Cell biology, chapter 3",
//!   "steps": [
//!     { "action": "open" },
//!     { "afterMs": 50,  "action": "speech", "toneHz": 220.0, "durationMs": 600, "chunks": 3 },
//!     { "afterMs": 300, "action": "interrupt" },
//!     { "afterMs": 20,  "action": "microphone", "durationMs": 512 },
//!     { "afterMs": 100, "action": "close", "reason": "done" }
//!   ]
//! }
//! ```
//!
//! Each state change is printed to stdout as one JSON line; a diagnostics
//! summary follows. Logs go to stderr (`RUST_LOG`, default `professor_core=info`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::TryRecvError};

use professor_core::audio::virtual_device::{VirtualBackend, VirtualDeviceHandle};
use professor_core::capture::CAPTURE_FRAME_SAMPLES;
use professor_core::codec::{self, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use professor_core::config::{load_config, SessionConfig};
use professor_core::engine::{
    DiagnosticsSnapshot, SessionController, SessionDiagnostics, SessionEvent, SessionRequest,
    StatusPublisher,
};
use professor_core::transport::{Attachment, RemoteControl, ScriptedTransport, ServerMessage};
use professor_core::{SessionState, SessionStatusEvent};

/// How long to wait for the capture worker to forward pushed microphone audio.
const CAPTURE_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct Args {
    script: PathBuf,
    config: Option<PathBuf>,
    wav_out: Option<PathBuf>,
    tail_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Script {
    #[serde(default)]
    context: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Step {
    /// Virtual time to let pass before the action.
    #[serde(default)]
    after_ms: u64,
    #[serde(flatten)]
    action: Action,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
enum Action {
    Open,
    #[serde(rename_all = "camelCase")]
    Speech {
        #[serde(default = "default_tone_hz")]
        tone_hz: f32,
        duration_ms: u64,
        #[serde(default = "default_chunks")]
        chunks: usize,
        /// Mark the first chunk as a barge-in.
        #[serde(default)]
        interrupted: bool,
    },
    Interrupt,
    /// Malformed reply audio; should be dropped without ending the session.
    Garbage,
    #[serde(rename_all = "camelCase")]
    Microphone { duration_ms: u64 },
    Close {
        #[serde(default)]
        reason: Option<String>,
    },
    Error { message: String },
    Retry,
    End,
    Start,
}

fn default_tone_hz() -> f32 {
    220.0
}

fn default_chunks() -> usize {
    1
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TimelineEntry {
    at_ms: f64,
    state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    generation: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    final_state: SessionState,
    virtual_ms: f64,
    sources_scheduled: usize,
    sources_stopped: usize,
    audio_frames_sent: usize,
    diagnostics: DiagnosticsSnapshot,
}

struct Replay {
    controller: SessionController,
    events: crossbeam_channel::Receiver<SessionEvent>,
    status: broadcast::Receiver<SessionStatusEvent>,
    devices: VirtualDeviceHandle,
    remote: RemoteControl,
    request: SessionRequest,
}

impl Replay {
    fn new(config: SessionConfig, request: SessionRequest) -> Self {
        let (backend, devices) = VirtualBackend::new();
        let (transport, remote) = ScriptedTransport::new();
        let (event_tx, events) = crossbeam_channel::unbounded();
        let publisher = StatusPublisher::new(256);
        let status = publisher.subscribe();
        let controller = SessionController::new(
            config,
            Box::new(backend),
            Box::new(transport),
            event_tx,
            publisher,
            Arc::new(SessionDiagnostics::default()),
        );
        Self {
            controller,
            events,
            status,
            devices,
            remote,
            request,
        }
    }

    fn advance_ms(&mut self, ms: u64) {
        if ms > 0 {
            self.devices.advance(ms as f64 / 1000.0);
        }
        self.controller.pump(&self.events);
        self.flush_timeline();
    }

    fn apply(&mut self, action: Action) {
        match action {
            Action::Open => {
                if !self.remote.open() {
                    tracing::warn!("open step ignored: transport not connected");
                }
            }
            Action::Speech {
                tone_hz,
                duration_ms,
                chunks,
                interrupted,
            } => {
                let tone = sine(tone_hz, duration_ms);
                let per_chunk = tone.len().div_ceil(chunks.max(1)).max(1);
                for (i, part) in tone.chunks(per_chunk).enumerate() {
                    self.remote.deliver(ServerMessage {
                        audio: Some(codec::encode(part).data),
                        interrupted: interrupted && i == 0,
                    });
                }
            }
            Action::Interrupt => {
                self.remote.interrupt();
            }
            Action::Garbage => {
                self.remote.deliver(ServerMessage::audio("AQID"));
            }
            Action::Microphone { duration_ms } => {
                let samples = (INPUT_SAMPLE_RATE as u64 * duration_ms / 1000) as usize;
                let expected = self.remote.sent_audio_count() + samples / CAPTURE_FRAME_SAMPLES;
                self.devices.push_input(&vec![0.05; samples]);
                self.wait_for_capture(expected);
            }
            Action::Close { reason } => {
                self.remote.close_remote(reason.as_deref());
            }
            Action::Error { message } => {
                self.remote.fail(&message);
            }
            Action::Retry => self.controller.retry(),
            Action::End => self.controller.end(),
            Action::Start => self.controller.start(self.request.clone()),
        }
        self.controller.pump(&self.events);
        self.flush_timeline();
    }

    fn wait_for_capture(&mut self, expected: usize) {
        let deadline = Instant::now() + CAPTURE_WAIT;
        while self.remote.sent_audio_count() < expected && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
            self.controller.pump(&self.events);
        }
        if self.remote.sent_audio_count() < expected {
            tracing::warn!(expected, "capture frames not forwarded in time");
        }
    }

    fn flush_timeline(&mut self) {
        let at_ms = self.devices.now() * 1000.0;
        for entry in drain_timeline(&mut self.status, at_ms) {
            match serde_json::to_string(&entry) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!("timeline entry not serializable: {e}"),
            }
        }
    }
}

/// Everything buffered on `status`, stamped with `at_ms`. Events lost to a
/// lagging receiver are reported and skipped.
fn drain_timeline(
    status: &mut broadcast::Receiver<SessionStatusEvent>,
    at_ms: f64,
) -> Vec<TimelineEntry> {
    let mut entries = Vec::new();
    loop {
        let event = match status.try_recv() {
            Ok(event) => event,
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "timeline fell behind, status events lost");
                continue;
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        };
        entries.push(TimelineEntry {
            at_ms,
            state: event.state,
            detail: event.detail,
            generation: event.generation,
        });
    }
    entries
}

fn sine(freq: f32, duration_ms: u64) -> Vec<f32> {
    let len = (OUTPUT_SAMPLE_RATE as u64 * duration_ms / 1000) as usize;
    let step = std::f32::consts::TAU * freq / OUTPUT_SAMPLE_RATE as f32;
    (0..len).map(|i| 0.3 * (step * i as f32).sin()).collect()
}

fn parse_args() -> anyhow::Result<Args> {
    let mut script: Option<PathBuf> = None;
    let mut config: Option<PathBuf> = None;
    let mut wav_out: Option<PathBuf> = None;
    let mut tail_ms: u64 = 1_000;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--script" => {
                let Some(v) = it.next() else {
                    bail!("missing value for --script");
                };
                script = Some(PathBuf::from(v));
            }
            "--config" => {
                let Some(v) = it.next() else {
                    bail!("missing value for --config");
                };
                config = Some(PathBuf::from(v));
            }
            "--wav-out" => {
                let Some(v) = it.next() else {
                    bail!("missing value for --wav-out");
                };
                wav_out = Some(PathBuf::from(v));
            }
            "--tail-ms" => {
                let Some(v) = it.next() else {
                    bail!("missing value for --tail-ms");
                };
                tail_ms = v
                    .parse::<u64>()
                    .context("invalid value for --tail-ms")?;
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p professor-core --bin session-replay -- \\
  --script <file.json> [--config <session.json>] [--wav-out <file.wav>] [--tail-ms <n>]"
                );
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }

    let Some(script) = script else {
        bail!("--script is required");
    };
    Ok(Args {
        script,
        config,
        wav_out,
        tail_ms,
    })
}

fn write_wav(path: &Path, samples: &[f32]) -> anyhow::Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: OUTPUT_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("cannot create {}", path.display()))?;
    for s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(v)?;
    }
    writer.finalize()?;
    Ok(())
}

fn run() -> anyhow::Result<()> {
    let args = parse_args()?;

    let raw = std::fs::read_to_string(&args.script)
        .with_context(|| format!("cannot read {}", args.script.display()))?;
    let script: Script = serde_json::from_str(&raw).context("invalid script")?;

    let mut config = match &args.config {
        Some(path) => load_config(path),
        None => SessionConfig::default(),
    };
    config.apply_env_overrides();

    let request = SessionRequest::new(script.context, script.attachments);
    let mut replay = Replay::new(config, request.clone());
    replay.controller.start(request);
    replay.advance_ms(0);

    for step in script.steps {
        replay.advance_ms(step.after_ms);
        replay.apply(step.action);
    }
    replay.advance_ms(args.tail_ms);

    let summary = Summary {
        final_state: replay.controller.state(),
        virtual_ms: replay.devices.now() * 1000.0,
        sources_scheduled: replay.devices.sources().len(),
        sources_stopped: replay.devices.stopped_count(),
        audio_frames_sent: replay.remote.sent_audio_count(),
        diagnostics: replay.controller.diagnostics().snapshot(),
    };

    if let Some(path) = &args.wav_out {
        let track = replay.devices.render(OUTPUT_SAMPLE_RATE)?;
        write_wav(path, &track)?;
        tracing::info!(path = %path.display(), samples = track.len(), "rendered playback");
    }

    replay.controller.end();
    let summary = serde_json::to_string_pretty(&summary)?;
    println!("{summary}");
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("professor_core=info")),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("session-replay failed: {e:#}");
        std::process::exit(1);
    }
}
