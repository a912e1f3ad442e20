//! Virtual audio devices driven by a manual clock.
//!
//! `VirtualBackend` stands in for a microphone and speakers. Time only moves
//! when [`VirtualDeviceHandle::advance`] is called; sources whose end falls
//! inside the advanced span finish and are reported through the session event
//! queue exactly like the cpal output reports them. The handle also feeds
//! microphone samples, counts device acquire/release pairs, can make the next
//! acquisition fail, and renders what was audible into a single track.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::audio::output::{render_block, Voice};
use crate::audio::resample::convert_buffer;
use crate::audio::{AudioBackend, InputStream};
use crate::buffering::chunk::PlaybackBuffer;
use crate::buffering::{AudioProducer, Producer};
use crate::codec::INPUT_SAMPLE_RATE;
use crate::engine::events::EventSender;
use crate::error::{ProfessorError, Result};
use crate::playback::{AudioOutput, SourceId};

/// Tolerance when comparing accumulated f64 clock positions.
const CLOCK_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceState {
    Scheduled,
    Finished,
    /// Cut off at the given device time.
    Stopped { at: f64 },
}

/// A source as the virtual speaker saw it.
#[derive(Debug, Clone)]
pub struct VirtualSource {
    pub id: SourceId,
    pub start: f64,
    pub buffer: PlaybackBuffer,
    pub state: SourceState,
}

impl VirtualSource {
    pub fn end(&self) -> f64 {
        self.start + self.buffer.duration_secs()
    }
}

struct Rig {
    now: f64,
    output_events: Option<EventSender>,
    sources: Vec<VirtualSource>,
    producer: Option<AudioProducer>,
    input_rate: u32,
    input_opens: usize,
    input_closes: usize,
    output_opens: usize,
    output_closes: usize,
    fail_next_input: Option<String>,
    fail_next_output: Option<String>,
}

impl Default for Rig {
    fn default() -> Self {
        Self {
            now: 0.0,
            output_events: None,
            sources: Vec::new(),
            producer: None,
            input_rate: INPUT_SAMPLE_RATE,
            input_opens: 0,
            input_closes: 0,
            output_opens: 0,
            output_closes: 0,
            fail_next_input: None,
            fail_next_output: None,
        }
    }
}

pub struct VirtualBackend {
    rig: Arc<Mutex<Rig>>,
}

/// Test/replay side of a [`VirtualBackend`].
#[derive(Clone)]
pub struct VirtualDeviceHandle {
    rig: Arc<Mutex<Rig>>,
}

impl VirtualBackend {
    pub fn new() -> (Self, VirtualDeviceHandle) {
        let rig = Arc::new(Mutex::new(Rig::default()));
        (
            Self {
                rig: Arc::clone(&rig),
            },
            VirtualDeviceHandle { rig },
        )
    }
}

impl AudioBackend for VirtualBackend {
    fn open_output(&mut self, events: EventSender) -> Result<Box<dyn AudioOutput>> {
        let mut rig = self.rig.lock();
        if let Some(reason) = rig.fail_next_output.take() {
            return Err(ProfessorError::DeviceAcquisition(reason));
        }
        rig.output_opens += 1;
        rig.output_events = Some(events);
        Ok(Box::new(VirtualOutput {
            rig: Arc::clone(&self.rig),
            open: true,
        }))
    }

    fn open_input(
        &mut self,
        producer: AudioProducer,
        _events: EventSender,
    ) -> Result<Box<dyn InputStream>> {
        let mut rig = self.rig.lock();
        if let Some(reason) = rig.fail_next_input.take() {
            return Err(ProfessorError::DeviceAcquisition(reason));
        }
        rig.input_opens += 1;
        rig.producer = Some(producer);
        Ok(Box::new(VirtualInput {
            rig: Arc::clone(&self.rig),
            sample_rate: rig.input_rate,
            open: true,
        }))
    }
}

struct VirtualOutput {
    rig: Arc<Mutex<Rig>>,
    open: bool,
}

impl AudioOutput for VirtualOutput {
    fn current_time(&self) -> f64 {
        self.rig.lock().now
    }

    fn start_source(&mut self, id: SourceId, buffer: PlaybackBuffer, start_at: f64) -> Result<()> {
        self.rig.lock().sources.push(VirtualSource {
            id,
            start: start_at,
            buffer,
            state: SourceState::Scheduled,
        });
        Ok(())
    }

    fn stop_source(&mut self, id: SourceId) {
        let mut rig = self.rig.lock();
        let now = rig.now;
        for src in rig.sources.iter_mut().filter(|s| s.id == id) {
            if src.state == SourceState::Scheduled {
                src.state = SourceState::Stopped { at: now };
            }
        }
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut rig = self.rig.lock();
        let now = rig.now;
        for src in rig.sources.iter_mut() {
            if src.state == SourceState::Scheduled {
                src.state = SourceState::Stopped { at: now };
            }
        }
        rig.output_events = None;
        rig.output_closes += 1;
    }
}

struct VirtualInput {
    rig: Arc<Mutex<Rig>>,
    sample_rate: u32,
    open: bool,
}

impl InputStream for VirtualInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut rig = self.rig.lock();
        rig.producer = None;
        rig.input_closes += 1;
    }
}

impl VirtualDeviceHandle {
    pub fn now(&self) -> f64 {
        self.rig.lock().now
    }

    /// Move the clock forward, finishing every scheduled source that ends
    /// within the span. Returns the ids that finished, in start order.
    pub fn advance(&self, secs: f64) -> Vec<SourceId> {
        let mut rig = self.rig.lock();
        rig.now += secs.max(0.0);
        let now = rig.now;

        let mut done: Vec<(f64, SourceId)> = Vec::new();
        for src in rig.sources.iter_mut() {
            if src.state == SourceState::Scheduled && src.end() <= now + CLOCK_EPSILON {
                src.state = SourceState::Finished;
                done.push((src.start, src.id));
            }
        }
        done.sort_by(|a, b| a.0.total_cmp(&b.0));

        if let Some(events) = rig.output_events.as_ref() {
            for (_, id) in &done {
                events.playback_ended(*id);
            }
        }
        if !done.is_empty() {
            debug!(now, finished = done.len(), "virtual clock advanced");
        }
        done.into_iter().map(|(_, id)| id).collect()
    }

    /// Feed microphone samples. Returns how many were accepted (0 when no
    /// input is open).
    pub fn push_input(&self, samples: &[f32]) -> usize {
        self.rig
            .lock()
            .producer
            .as_mut()
            .map(|p| p.push_slice(samples))
            .unwrap_or(0)
    }

    /// Capture rate reported by inputs opened from now on.
    pub fn set_input_rate(&self, rate: u32) {
        self.rig.lock().input_rate = rate;
    }

    pub fn fail_next_input(&self, reason: impl Into<String>) {
        self.rig.lock().fail_next_input = Some(reason.into());
    }

    pub fn fail_next_output(&self, reason: impl Into<String>) {
        self.rig.lock().fail_next_output = Some(reason.into());
    }

    pub fn sources(&self) -> Vec<VirtualSource> {
        self.rig.lock().sources.clone()
    }

    /// Sources started but neither finished nor stopped.
    pub fn scheduled_count(&self) -> usize {
        self.rig
            .lock()
            .sources
            .iter()
            .filter(|s| s.state == SourceState::Scheduled)
            .count()
    }

    pub fn stopped_count(&self) -> usize {
        self.rig
            .lock()
            .sources
            .iter()
            .filter(|s| matches!(s.state, SourceState::Stopped { .. }))
            .count()
    }

    pub fn input_opens(&self) -> usize {
        self.rig.lock().input_opens
    }

    pub fn input_closes(&self) -> usize {
        self.rig.lock().input_closes
    }

    pub fn output_opens(&self) -> usize {
        self.rig.lock().output_opens
    }

    pub fn output_closes(&self) -> usize {
        self.rig.lock().output_closes
    }

    /// Mix everything that was audible (stopped sources up to their stop
    /// time) into one mono track at `sample_rate`, starting at clock 0.
    pub fn render(&self, sample_rate: u32) -> Result<Vec<f32>> {
        let sources = self.sources();
        let rate = sample_rate as f64;

        let mut voices = Vec::with_capacity(sources.len());
        let mut total_frames = 0u64;
        for src in &sources {
            let audible_until = match src.state {
                SourceState::Stopped { at } => at.min(src.end()),
                _ => src.end(),
            };
            if audible_until <= src.start {
                continue;
            }
            let mut samples =
                convert_buffer(&src.buffer.samples, src.buffer.sample_rate, sample_rate)?;
            samples.truncate(((audible_until - src.start) * rate).round() as usize);

            let voice = Voice {
                id: src.id.0,
                start_frame: (src.start * rate).round() as u64,
                samples,
            };
            total_frames = total_frames.max(voice.end_frame());
            voices.push(voice);
        }

        let mut track = vec![0f32; total_frames as usize];
        let mut finished = Vec::new();
        render_block(&mut voices, &mut track, 1, 0, &mut finished);
        Ok(track)
    }
}
