//! Mock audio source for testing without hardware.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{CaptureSource, SourceRing, SourceType};
use crate::format::Format;
use crate::gain::Gain;
use crate::timeline::{TimelineFunction, NANOS_PER_SECOND};

/// A deterministic source for driving the capturer in tests and CI.
///
/// The mock owns a [`SourceRing`] and a manually anchored clock transform:
/// the test writes frames at absolute positions, starts the clock, and the
/// capturer sees exactly the data and timing the test described.
///
/// # Example
///
/// ```
/// use capture_mix::{Format, MockSource, SampleFormat};
///
/// let format = Format::new(SampleFormat::F32, 1, 48000).unwrap();
/// let source = MockSource::new("mic", format, 4800);
/// source.fill_ramp(0, 4800, 0.0, 0.0001);
/// source.start_clock(0);
/// ```
pub struct MockSource {
    name: String,
    source_type: SourceType,
    format: Mutex<Option<Format>>,
    ring: Option<Arc<SourceRing>>,
    transform: Mutex<TimelineFunction>,
    generation: AtomicU64,
    gain: Gain,
}

impl MockSource {
    /// Creates a continuous source with a known format and a ring of the
    /// given size. Its clock is not running until [`start_clock`] is called.
    ///
    /// [`start_clock`]: MockSource::start_clock
    pub fn new(name: &str, format: Format, ring_frames: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            source_type: SourceType::Continuous,
            ring: Some(SourceRing::new(ring_frames, format.channels)),
            format: Mutex::new(Some(format)),
            transform: Mutex::new(TimelineFunction::invalid()),
            generation: AtomicU64::new(0),
            gain: Gain::new(),
        })
    }

    /// Creates a continuous source whose format is not yet known.
    ///
    /// Such a link is legal and is skipped silently until
    /// [`set_format`](MockSource::set_format) is called.
    pub fn unconfigured(name: &str, ring_frames: usize, channels: u16) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            source_type: SourceType::Continuous,
            ring: Some(SourceRing::new(ring_frames, channels)),
            format: Mutex::new(None),
            transform: Mutex::new(TimelineFunction::invalid()),
            generation: AtomicU64::new(0),
            gain: Gain::new(),
        })
    }

    /// Creates a packet-backed source; never mixed by the ring strategy.
    pub fn packet(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            source_type: SourceType::Packet,
            ring: None,
            format: Mutex::new(None),
            transform: Mutex::new(TimelineFunction::invalid()),
            generation: AtomicU64::new(0),
            gain: Gain::new(),
        })
    }

    /// Supplies the format after construction.
    pub fn set_format(&self, format: Format) {
        *self.format.lock() = Some(format);
    }

    /// Anchors the clock: frame 0 is produced at `reference_nanos` and the
    /// position advances at the source's frame rate. Bumps the generation.
    ///
    /// Does nothing if the format is not yet known.
    pub fn start_clock(&self, reference_nanos: i64) {
        let Some(format) = *self.format.lock() else {
            tracing::warn!(source = %self.name, "start_clock before format is known");
            return;
        };
        *self.transform.lock() = TimelineFunction::new(
            0,
            reference_nanos,
            format.frames_per_second,
            NANOS_PER_SECOND,
        );
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Stops the clock, resetting the transform to the invalid sentinel.
    pub fn stop_clock(&self) {
        *self.transform.lock() = TimelineFunction::invalid();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Writes interleaved frames at an absolute position.
    pub fn write_frames(&self, start_frame: i64, samples: &[f32]) {
        if let Some(ring) = &self.ring {
            ring.write_at(start_frame, samples);
        }
    }

    /// Fills `frames` frames with a linear ramp, identical on every
    /// channel. Deterministic data for exact-comparison tests.
    pub fn fill_ramp(&self, start_frame: i64, frames: usize, start: f32, step: f32) {
        let Some(ring) = &self.ring else { return };
        let channels = ring.channels() as usize;
        let mut samples = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            let value = start + step * i as f32;
            samples.extend(std::iter::repeat(value).take(channels));
        }
        ring.write_at(start_frame, &samples);
    }

    /// Fills `frames` frames with a sine wave at the given frequency.
    pub fn fill_sine(&self, start_frame: i64, frames: usize, frequency: f64, amplitude: f64) {
        let Some(ring) = &self.ring else { return };
        let Some(format) = *self.format.lock() else { return };
        let channels = ring.channels() as usize;
        let rate = f64::from(format.frames_per_second);
        let mut samples = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            let t = (start_frame + i as i64) as f64 / rate;
            let value = (amplitude * (2.0 * std::f64::consts::PI * frequency * t).sin()) as f32;
            samples.extend(std::iter::repeat(value).take(channels));
        }
        ring.write_at(start_frame, &samples);
    }
}

impl CaptureSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_type(&self) -> SourceType {
        self.source_type
    }

    fn format(&self) -> Option<Format> {
        *self.format.lock()
    }

    fn ring(&self) -> Option<Arc<SourceRing>> {
        self.ring.clone()
    }

    fn position_transform(&self) -> (TimelineFunction, u64) {
        (*self.transform.lock(), self.generation.load(Ordering::SeqCst))
    }

    fn gain(&self) -> &Gain {
        &self.gain
    }
}
