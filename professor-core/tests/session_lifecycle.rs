use std::thread;
use std::time::{Duration, Instant};

use professor_core::audio::virtual_device::{VirtualBackend, VirtualDeviceHandle};
use professor_core::capture::CAPTURE_FRAME_SAMPLES;
use professor_core::codec::OUTPUT_SAMPLE_RATE;
use professor_core::transport::{OutboundMessage, RemoteControl, ScriptedTransport};
use professor_core::{
    Attachment, LiveSession, ServerMessage, SessionConfig, SessionState, SessionStatusEvent,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

const TIMEOUT: Duration = Duration::from_secs(2);

fn spawn_session() -> (LiveSession, VirtualDeviceHandle, RemoteControl) {
    let (backend, devices) = VirtualBackend::new();
    let (transport, remote) = ScriptedTransport::new();
    let session = LiveSession::spawn(SessionConfig::default(), backend, transport)
        .expect("spawn session worker");
    (session, devices, remote)
}

fn wait_for_state(
    rx: &mut broadcast::Receiver<SessionStatusEvent>,
    expected: SessionState,
) -> SessionStatusEvent {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) if ev.state == expected => return ev,
            Ok(_) => continue,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= TIMEOUT {
                    panic!("timed out waiting for {expected:?}");
                }
                thread::sleep(Duration::from_millis(2));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("status channel closed unexpectedly"),
        }
    }
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() >= TIMEOUT {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(2));
    }
}

fn speech(secs: f64) -> Vec<f32> {
    vec![0.25; (secs * OUTPUT_SAMPLE_RATE as f64).round() as usize]
}

#[test]
fn conversation_round_trip_releases_everything_once() {
    let (session, devices, remote) = spawn_session();
    let mut status = session.subscribe_status();
    assert_eq!(session.state(), SessionState::Idle);

    let page = Attachment::from_bytes("image/png", b"\x89PNG");
    session
        .start_session("Thermodynamics, lecture 2", vec![page])
        .unwrap();
    wait_for_state(&mut status, SessionState::Connecting);
    wait_until("transport connect", || remote.is_connected());

    assert!(remote.open());
    wait_for_state(&mut status, SessionState::Listening);
    let sent = remote.sent();
    assert!(matches!(sent.first(), Some(OutboundMessage::Attachment(_))));
    assert!(matches!(sent.last(), Some(OutboundMessage::Text { .. })));

    assert!(remote.deliver_speech(&speech(0.2)));
    assert!(remote.deliver_speech(&speech(0.2)));
    wait_for_state(&mut status, SessionState::Speaking);
    wait_until("both chunks scheduled", || devices.sources().len() == 2);

    let sources = devices.sources();
    assert!((sources[1].start - sources[0].end()).abs() < 1e-9);

    devices.advance(0.4);
    wait_for_state(&mut status, SessionState::Listening);

    session.end_session().unwrap();
    wait_for_state(&mut status, SessionState::Closed);
    assert_eq!(session.error(), None);
    assert_eq!(remote.closes(), 1);
    assert_eq!(devices.input_closes(), 1);
    assert_eq!(devices.output_closes(), 1);
    assert_eq!(session.diagnostics_snapshot().teardowns, 1);

    drop(session);
    assert_eq!(remote.closes(), 1);
    assert_eq!(devices.output_closes(), 1);
}

#[test]
fn transport_error_while_speaking_then_retry() {
    let (session, devices, remote) = spawn_session();
    let mut status = session.subscribe_status();
    remote.set_auto_open(true);

    session.start_session("Organic chemistry", Vec::new()).unwrap();
    wait_for_state(&mut status, SessionState::Listening);

    remote.deliver_speech(&speech(1.0));
    wait_for_state(&mut status, SessionState::Speaking);

    remote.fail("network unreachable");
    let failed = wait_for_state(&mut status, SessionState::Error);
    assert!(failed.detail.unwrap().contains("network unreachable"));
    assert!(session.error().unwrap().contains("network unreachable"));
    assert_eq!(devices.scheduled_count(), 0);
    assert_eq!(devices.stopped_count(), 1);

    session.retry().unwrap();
    let reconnecting = wait_for_state(&mut status, SessionState::Connecting);
    assert_eq!(reconnecting.generation, 2);
    let reopened = wait_for_state(&mut status, SessionState::Listening);
    assert_eq!(reopened.generation, 2);
    assert_eq!(remote.connects(), 2);
    assert_eq!(devices.input_opens(), 2);
}

#[test]
fn microphone_frames_stream_while_listening() {
    let (session, devices, remote) = spawn_session();
    let mut status = session.subscribe_status();
    remote.set_auto_open(true);

    session.start_session("Linear algebra", Vec::new()).unwrap();
    wait_for_state(&mut status, SessionState::Listening);

    let pushed = devices.push_input(&vec![0.1; CAPTURE_FRAME_SAMPLES * 2 + 100]);
    assert_eq!(pushed, CAPTURE_FRAME_SAMPLES * 2 + 100);
    wait_until("two capture frames", || remote.sent_audio_count() == 2);

    let audio: Vec<_> = remote
        .sent()
        .into_iter()
        .filter_map(|m| match m {
            OutboundMessage::Audio(chunk) => Some(chunk),
            _ => None,
        })
        .collect();
    assert!(audio.iter().all(|c| c.mime_type == "audio/pcm;rate=16000"));
    assert!(audio.iter().all(|c| c.pcm_len() == CAPTURE_FRAME_SAMPLES * 2));
    assert_eq!(session.diagnostics_snapshot().chunks_sent, 2);
}

#[test]
fn malformed_and_interrupted_replies_keep_session_open() {
    let (session, devices, remote) = spawn_session();
    let mut status = session.subscribe_status();
    remote.set_auto_open(true);

    session.start_session("Medieval history", Vec::new()).unwrap();
    wait_for_state(&mut status, SessionState::Listening);

    remote.deliver(ServerMessage::audio("not base64!"));
    remote.deliver_speech(&speech(0.5));
    wait_for_state(&mut status, SessionState::Speaking);

    remote.interrupt();
    wait_for_state(&mut status, SessionState::Listening);
    wait_until("interruption counted", || {
        session.diagnostics_snapshot().interruptions == 1
    });

    let stats = session.diagnostics_snapshot();
    assert_eq!(stats.malformed_dropped, 1);
    assert_eq!(stats.buffers_scheduled, 1);
    assert_eq!(devices.stopped_count(), 1);
    assert_eq!(session.state(), SessionState::Listening);
}

#[test]
fn remote_close_reports_reason() {
    let (session, devices, remote) = spawn_session();
    let mut status = session.subscribe_status();
    remote.set_auto_open(true);

    session.start_session("Astronomy", Vec::new()).unwrap();
    wait_for_state(&mut status, SessionState::Listening);

    remote.close_remote(Some("idle timeout"));
    let closed = wait_for_state(&mut status, SessionState::Closed);
    assert_eq!(closed.detail.as_deref(), Some("idle timeout"));
    assert_eq!(devices.input_closes(), 1);
    assert_eq!(devices.output_closes(), 1);
}

#[test]
fn missing_microphone_surfaces_as_error() {
    let (session, devices, remote) = spawn_session();
    let mut status = session.subscribe_status();
    devices.fail_next_input("no default input device");

    session.start_session("Geometry", Vec::new()).unwrap();
    let failed = wait_for_state(&mut status, SessionState::Error);
    assert!(failed.detail.unwrap().contains("no default input device"));
    assert_eq!(remote.connects(), 0);
    assert_eq!(devices.output_closes(), 1);
}

#[test]
fn dropping_the_handle_tears_down_the_live_session() {
    let (session, devices, remote) = spawn_session();
    let mut status = session.subscribe_status();
    remote.set_auto_open(true);

    session.start_session("Economics", Vec::new()).unwrap();
    wait_for_state(&mut status, SessionState::Listening);
    remote.deliver_speech(&speech(0.3));
    wait_for_state(&mut status, SessionState::Speaking);

    drop(session);
    assert_eq!(remote.closes(), 1);
    assert_eq!(devices.input_closes(), 1);
    assert_eq!(devices.output_closes(), 1);
    assert_eq!(devices.scheduled_count(), 0);
}

#[test]
fn retry_before_any_session_is_ignored() {
    let (session, _devices, remote) = spawn_session();
    let mut status = session.subscribe_status();

    session.retry().unwrap();
    session.start_session("Statistics", Vec::new()).unwrap();
    let connecting = wait_for_state(&mut status, SessionState::Connecting);
    assert_eq!(connecting.generation, 1);
    wait_until("transport connect", || remote.is_connected());
    assert_eq!(remote.connects(), 1);
}
