//! Capture format and destination sample conversion.
//!
//! The capture format is fixed at capturer construction and immutable
//! afterward; everything downstream (payload geometry, mix job bounds,
//! scratch sizing) is derived from it. Mixing always accumulates into an
//! f32 scratch buffer; conversion to the destination sample format happens
//! once, when a mixed region is written into the payload buffer.

use crate::error::CaptureError;

/// Wall-clock ceiling for a single mix job.
///
/// Bounds worst-case mixing latency: a job never covers more output than
/// this much real time, regardless of how large the pending buffer is.
const MAX_MIX_JOB_NANOS: u64 = 50_000_000;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Destination sample formats supported by the payload buffer.
///
/// Payload bytes are little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Unsigned 8-bit PCM, biased at 128.
    U8,
    /// Signed 16-bit PCM.
    I16,
    /// Signed 32-bit PCM.
    I32,
    /// 32-bit float PCM in [-1.0, 1.0].
    F32,
}

impl SampleFormat {
    /// Returns the size of one sample in bytes.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I16 => 2,
            Self::I32 | Self::F32 => 4,
        }
    }
}

/// An immutable audio stream format.
///
/// # Example
///
/// ```
/// use capture_mix::{Format, SampleFormat};
///
/// let format = Format::new(SampleFormat::I16, 2, 48000).unwrap();
/// assert_eq!(format.bytes_per_frame(), 4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    /// Sample format of the destination payload.
    pub sample_format: SampleFormat,
    /// Number of channels (1 = mono, 2 = stereo).
    pub channels: u16,
    /// Frame rate in Hz.
    pub frames_per_second: u32,
}

/// Maximum supported channel count.
pub const MAX_CHANNELS: u16 = 8;

/// Supported frame rate range in Hz.
pub const MIN_FRAMES_PER_SECOND: u32 = 1_000;
/// Supported frame rate range in Hz.
pub const MAX_FRAMES_PER_SECOND: u32 = 192_000;

impl Format {
    /// Creates a format, validating channel count and frame rate.
    pub fn new(
        sample_format: SampleFormat,
        channels: u16,
        frames_per_second: u32,
    ) -> Result<Self, CaptureError> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(CaptureError::invalid_argument(format!(
                "channel count {channels} outside 1..={MAX_CHANNELS}"
            )));
        }
        if !(MIN_FRAMES_PER_SECOND..=MAX_FRAMES_PER_SECOND).contains(&frames_per_second) {
            return Err(CaptureError::invalid_argument(format!(
                "frame rate {frames_per_second} outside \
                 {MIN_FRAMES_PER_SECOND}..={MAX_FRAMES_PER_SECOND}"
            )));
        }
        Ok(Self {
            sample_format,
            channels,
            frames_per_second,
        })
    }

    /// Returns the size of one frame (one sample per channel) in bytes.
    pub fn bytes_per_frame(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channels as usize
    }

    /// Returns the largest number of frames a single mix job may produce.
    ///
    /// Derived from the fixed wall-clock ceiling and the frame rate; never
    /// less than one frame.
    pub fn max_frames_per_mix(&self) -> u32 {
        let frames =
            u64::from(self.frames_per_second) * MAX_MIX_JOB_NANOS / NANOS_PER_SECOND;
        (frames as u32).max(1)
    }
}

/// Converts f32 scratch samples to destination bytes.
///
/// `scratch.len()` samples are written; `dest` must hold exactly
/// `scratch.len() * bytes_per_sample` bytes.
pub(crate) fn write_scratch(dest: &mut [u8], sample_format: SampleFormat, scratch: &[f32]) {
    match sample_format {
        SampleFormat::U8 => {
            for (d, &s) in dest.iter_mut().zip(scratch) {
                *d = (((s * 127.0).clamp(-128.0, 127.0)) as i16 + 128) as u8;
            }
        }
        SampleFormat::I16 => {
            for (chunk, &s) in dest.chunks_exact_mut(2).zip(scratch) {
                // × 32767 for symmetric scaling; -1.0 maps to -32767.
                let v = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
                chunk.copy_from_slice(&v.to_le_bytes());
            }
        }
        SampleFormat::I32 => {
            for (chunk, &s) in dest.chunks_exact_mut(4).zip(scratch) {
                let v = (f64::from(s) * 2_147_483_647.0)
                    .clamp(-2_147_483_648.0, 2_147_483_647.0) as i32;
                chunk.copy_from_slice(&v.to_le_bytes());
            }
        }
        SampleFormat::F32 => {
            // Raw float passthrough: mixed values are stored exactly.
            for (chunk, &s) in dest.chunks_exact_mut(4).zip(scratch) {
                chunk.copy_from_slice(&s.to_le_bytes());
            }
        }
    }
}

/// Decodes payload bytes back into f32 samples.
///
/// The inverse of the destination conversion, for clients inspecting
/// delivered regions. `F32` round-trips exactly; integer formats round-trip
/// to within one quantization step.
pub fn samples_from_bytes(bytes: &[u8], sample_format: SampleFormat) -> Vec<f32> {
    match sample_format {
        SampleFormat::U8 => bytes
            .iter()
            .map(|&b| (f32::from(b) - 128.0) / 128.0)
            .collect(),
        SampleFormat::I16 => bytes
            .chunks_exact(2)
            .map(|c| f32::from(i16::from_le_bytes([c[0], c[1]])) / 32768.0)
            .collect(),
        SampleFormat::I32 => bytes
            .chunks_exact(4)
            .map(|c| {
                (f64::from(i32::from_le_bytes([c[0], c[1], c[2], c[3]])) / 2_147_483_648.0) as f32
            })
            .collect(),
        SampleFormat::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    }
}
