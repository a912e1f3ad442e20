//! Capture pipeline: ring buffer → 16 kHz frames → encoded chunks → sink.
//!
//! ```text
//! input callback ──push_slice──► SPSC ring ──► capture worker
//!                                                │ resample to 16 kHz
//!                                                │ assemble 4096-sample frames
//!                                                │ codec::encode
//!                                                ▼
//!                                          ChunkSink::deliver
//! ```
//!
//! Each complete frame is encoded and delivered synchronously on the worker;
//! there is no queue of encoded chunks and nothing is dropped. Flow control
//! belongs to the sink.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::audio::resample::RateConverter;
use crate::buffering::{AudioConsumer, Consumer};
use crate::codec::{self, EncodedChunk, INPUT_SAMPLE_RATE};
use crate::error::{ProfessorError, Result};

/// Samples per encoded capture frame (256 ms at 16 kHz).
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;

/// Samples drained from the ring per iteration.
const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring is empty (avoids busy-wait burning a core).
const EMPTY_SLEEP_MS: u64 = 5;

/// Receiver of encoded capture frames.
pub trait ChunkSink: Send + 'static {
    /// Hand one chunk on. An error stops the pipeline.
    fn deliver(&mut self, chunk: EncodedChunk) -> Result<()>;
}

impl<F> ChunkSink for F
where
    F: FnMut(EncodedChunk) -> Result<()> + Send + 'static,
{
    fn deliver(&mut self, chunk: EncodedChunk) -> Result<()> {
        self(chunk)
    }
}

#[derive(Default)]
pub struct CapturePipeline {
    running: Arc<AtomicBool>,
    frames_sent: Arc<AtomicUsize>,
    worker: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the capture worker reading from `consumer`, which carries mono
    /// samples at `capture_rate`.
    ///
    /// # Errors
    /// - `ProfessorError::AlreadyRunning` if the pipeline is active.
    /// - `ProfessorError::AudioStream` if no converter exists for `capture_rate`.
    pub fn start<S: ChunkSink>(
        &mut self,
        consumer: AudioConsumer,
        capture_rate: u32,
        sink: S,
    ) -> Result<()> {
        if self.worker.is_some() {
            return Err(ProfessorError::AlreadyRunning);
        }

        let converter = RateConverter::new(capture_rate, INPUT_SAMPLE_RATE, DRAIN_CHUNK)?;
        self.running.store(true, Ordering::SeqCst);
        self.frames_sent.store(0, Ordering::Relaxed);

        let running = Arc::clone(&self.running);
        let frames_sent = Arc::clone(&self.frames_sent);
        let worker = std::thread::Builder::new()
            .name("professor-capture".into())
            .spawn(move || run(consumer, converter, sink, running, frames_sent))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                ProfessorError::Io(e)
            })?;

        self.worker = Some(worker);
        info!(capture_rate, "capture pipeline started");
        Ok(())
    }

    /// Stop the worker and release the frame source.
    ///
    /// Returns `true` if a running pipeline was stopped.
    pub fn stop(&mut self) -> bool {
        self.running.store(false, Ordering::SeqCst);
        let Some(worker) = self.worker.take() else {
            return false;
        };
        if worker.join().is_err() {
            warn!("capture worker panicked");
        }
        info!(
            frames = self.frames_sent.load(Ordering::Relaxed),
            "capture pipeline stopped"
        );
        true
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some() && self.running.load(Ordering::Relaxed)
    }

    /// Frames delivered since the last `start`.
    pub fn frames_sent(&self) -> usize {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<S: ChunkSink>(
    mut consumer: AudioConsumer,
    mut converter: RateConverter,
    mut sink: S,
    running: Arc<AtomicBool>,
    frames_sent: Arc<AtomicUsize>,
) {
    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut frame: Vec<f32> = Vec::with_capacity(CAPTURE_FRAME_SAMPLES * 2);

    while running.load(Ordering::Relaxed) {
        let n = consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(Duration::from_millis(EMPTY_SLEEP_MS));
            continue;
        }

        frame.extend(converter.process(&raw[..n]));

        while frame.len() >= CAPTURE_FRAME_SAMPLES {
            let chunk = codec::encode(&frame[..CAPTURE_FRAME_SAMPLES]);
            frame.drain(..CAPTURE_FRAME_SAMPLES);

            if let Err(e) = sink.deliver(chunk) {
                warn!("capture sink rejected frame, stopping capture: {e}");
                running.store(false, Ordering::SeqCst);
                return;
            }
            let sent = frames_sent.fetch_add(1, Ordering::Relaxed) + 1;
            if sent % 40 == 0 {
                debug!(frames = sent, "capture frames delivered");
            }
        }
    }

    if !frame.is_empty() {
        debug!(samples = frame.len(), "discarding trailing partial frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Instant;

    use parking_lot::Mutex;

    use crate::buffering::{create_audio_ring, Producer};

    fn collecting_sink() -> (impl ChunkSink, Arc<Mutex<Vec<EncodedChunk>>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink_out = Arc::clone(&out);
        let sink = move |chunk: EncodedChunk| -> Result<()> {
            sink_out.lock().push(chunk);
            Ok(())
        };
        (sink, out)
    }

    fn wait_for(out: &Arc<Mutex<Vec<EncodedChunk>>>, count: usize) {
        let start = Instant::now();
        while out.lock().len() < count {
            if start.elapsed() > Duration::from_secs(2) {
                panic!("timed out waiting for {count} chunks, got {}", out.lock().len());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn emits_one_chunk_per_full_frame_in_order() {
        let (mut producer, consumer) = create_audio_ring();
        producer.push_slice(&vec![0.25; CAPTURE_FRAME_SAMPLES]);
        producer.push_slice(&vec![-0.5; CAPTURE_FRAME_SAMPLES]);
        producer.push_slice(&vec![0.1; 100]);

        let (sink, out) = collecting_sink();
        let mut pipeline = CapturePipeline::new();
        pipeline.start(consumer, INPUT_SAMPLE_RATE, sink).unwrap();
        wait_for(&out, 2);
        std::thread::sleep(Duration::from_millis(30));
        assert!(pipeline.stop());

        let chunks = out.lock();
        assert_eq!(chunks.len(), 2, "partial frame must not be sent");
        let first = codec::decode(&chunks[0].data, INPUT_SAMPLE_RATE).unwrap();
        let second = codec::decode(&chunks[1].data, INPUT_SAMPLE_RATE).unwrap();
        assert_eq!(first.samples.len(), CAPTURE_FRAME_SAMPLES);
        assert!((first.samples[0] - 0.25).abs() < 1e-4);
        assert!((second.samples[0] + 0.5).abs() < 1e-4);
        assert_eq!(chunks[0].mime_type, "audio/pcm;rate=16000");
        assert_eq!(pipeline.frames_sent(), 2);
    }

    #[test]
    fn converts_device_rate_down_to_16k() {
        let (mut producer, consumer) = create_audio_ring();
        producer.push_slice(&vec![0.0; 48_000]);

        let (sink, out) = collecting_sink();
        let mut pipeline = CapturePipeline::new();
        pipeline.start(consumer, 48_000, sink).unwrap();
        wait_for(&out, 3);
        pipeline.stop();

        // one second at 48 kHz is ~16 000 samples at 16 kHz: three full frames
        assert_eq!(out.lock().len(), 3);
    }

    #[test]
    fn stop_is_idempotent_and_safe_before_start() {
        let mut pipeline = CapturePipeline::new();
        assert!(!pipeline.stop());

        let (_producer, consumer) = create_audio_ring();
        let (sink, _out) = collecting_sink();
        pipeline.start(consumer, INPUT_SAMPLE_RATE, sink).unwrap();
        assert!(pipeline.is_running());
        assert!(pipeline.stop());
        assert!(!pipeline.stop());
        assert!(!pipeline.is_running());
    }

    #[test]
    fn second_start_is_rejected() {
        let mut pipeline = CapturePipeline::new();
        let (_p1, c1) = create_audio_ring();
        let (_p2, c2) = create_audio_ring();
        let (sink, _) = collecting_sink();
        let (sink2, _) = collecting_sink();

        pipeline.start(c1, INPUT_SAMPLE_RATE, sink).unwrap();
        assert!(matches!(
            pipeline.start(c2, INPUT_SAMPLE_RATE, sink2),
            Err(ProfessorError::AlreadyRunning)
        ));
    }

    #[test]
    fn failing_sink_stops_the_worker() {
        let (mut producer, consumer) = create_audio_ring();
        producer.push_slice(&vec![0.0; CAPTURE_FRAME_SAMPLES * 3]);

        let calls = Arc::new(AtomicUsize::new(0));
        let sink_calls = Arc::clone(&calls);
        let sink = move |_chunk: EncodedChunk| -> Result<()> {
            sink_calls.fetch_add(1, Ordering::SeqCst);
            Err(ProfessorError::Transport("closed".into()))
        };

        let mut pipeline = CapturePipeline::new();
        pipeline.start(consumer, INPUT_SAMPLE_RATE, sink).unwrap();
        let start = Instant::now();
        while pipeline.is_running() && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!pipeline.is_running());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.frames_sent(), 0);
    }
}
