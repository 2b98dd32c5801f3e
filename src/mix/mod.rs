//! Per-link resampling mixers.
//!
//! A [`Mixer`] consumes one linear region of a source ring and produces
//! frames into the f32 scratch buffer at the destination rate. Source read
//! positions are 32-bit fixed-point fractional frames ([`FRAC_BITS`] bits of
//! fraction); stepping uses an explicit `(step_size, rate_modulo,
//! denominator)` triple so long-running rate conversion accumulates no
//! drift.
//!
//! Two reference mixers are provided: [`PointSampler`] for identical frame
//! rates and [`LinearSampler`] for everything else. Selection happens once
//! per link, as soon as both the source and destination formats are known.

mod linear;
mod point;

pub use linear::LinearSampler;
pub use point::PointSampler;

use crate::error::CaptureError;
use crate::format::Format;
use crate::timeline::{FRAC_BITS, FRAC_ONE};

/// Largest linear region a single mix call may be handed, in frames.
///
/// Keeps `frames << FRAC_BITS` representable in the 32-bit fractional
/// position space.
pub(crate) const MAX_REGION_FRAMES: usize = (i32::MAX >> FRAC_BITS) as usize;

/// Per-link mix state threaded through every mixer invocation.
#[derive(Debug, Clone)]
pub struct Bookkeeping {
    /// Whole fractional-frame step per destination frame.
    pub step_size: u32,
    /// Remainder of the rate conversion, accumulated in `src_pos_modulo`.
    pub rate_modulo: u32,
    /// Denominator for `rate_modulo` accumulation (the destination rate).
    pub denominator: u32,
    /// Running remainder; carries one extra fractional unit into the
    /// position each time it wraps.
    pub src_pos_modulo: u32,
    /// Linear gain applied to every produced sample.
    pub amplitude: f32,
}

impl Default for Bookkeeping {
    /// Unity stepping: one source frame per destination frame.
    fn default() -> Self {
        Self {
            step_size: FRAC_ONE as u32,
            rate_modulo: 0,
            denominator: 1,
            src_pos_modulo: 0,
            amplitude: 1.0,
        }
    }
}

impl Bookkeeping {
    /// Builds stepping state for a source→destination rate pair.
    pub fn for_rates(source_fps: u32, dest_fps: u32) -> Self {
        let scaled = u64::from(source_fps) << FRAC_BITS;
        Self {
            step_size: (scaled / u64::from(dest_fps)) as u32,
            rate_modulo: (scaled % u64::from(dest_fps)) as u32,
            denominator: dest_fps,
            src_pos_modulo: 0,
            amplitude: 1.0,
        }
    }

    /// Advances a fractional position by one destination frame.
    pub(crate) fn advance_one(&mut self, pos: &mut i32) {
        *pos += self.step_size as i32;
        if self.rate_modulo > 0 {
            self.src_pos_modulo += self.rate_modulo;
            if self.src_pos_modulo >= self.denominator {
                self.src_pos_modulo -= self.denominator;
                *pos += 1;
            }
        }
    }

    /// Advances a wide fractional position by `frames` destination frames.
    pub(crate) fn advance(&mut self, pos: &mut i64, frames: u64) {
        *pos += self.step_size as i64 * frames as i64;
        if self.rate_modulo > 0 {
            let total = u64::from(self.src_pos_modulo) + u64::from(self.rate_modulo) * frames;
            *pos += (total / u64::from(self.denominator)) as i64;
            self.src_pos_modulo = (total % u64::from(self.denominator)) as u32;
        }
    }

    /// Returns the smallest number of destination frames that advances
    /// `pos` to at least `target`.
    pub(crate) fn frames_until(&self, pos: i64, target: i64) -> u64 {
        if target <= pos {
            return 0;
        }
        let delta = (target - pos) as u128;
        let denominator = u128::from(self.denominator.max(1));
        let numerator =
            (delta * denominator).saturating_sub(u128::from(self.src_pos_modulo));
        let per_frame = u128::from(self.step_size) * denominator + u128::from(self.rate_modulo);
        numerator.div_ceil(per_frame.max(1)) as u64
    }
}

/// A per-link resampling mixer.
///
/// One call consumes at most one linear source region. `dest` is the whole
/// scratch buffer for the job (interleaved destination channels);
/// `dest_offset` tracks the next frame to produce and is advanced in place.
/// `frac_source_offset` is the read position within the region, in
/// fractional frames, and must be non-negative on entry.
///
/// Returns `true` if the entire region was consumed, `false` if the
/// destination filled first.
pub trait Mixer: Send {
    /// Mixes one source region into the scratch buffer.
    #[allow(clippy::too_many_arguments)]
    fn mix(
        &mut self,
        dest: &mut [f32],
        dest_frames: usize,
        dest_offset: &mut usize,
        source: &[f32],
        frac_source_frames: u32,
        frac_source_offset: &mut i32,
        accumulate: bool,
        bookkeeping: &mut Bookkeeping,
    ) -> bool;
}

/// Selects a mixer for a source/destination format pair.
///
/// Fails when the source format cannot produce audio (a placeholder link);
/// the caller treats that as a broken link invariant.
pub fn select_mixer(source: &Format, dest: &Format) -> Result<Box<dyn Mixer>, CaptureError> {
    if source.channels == 0 || source.frames_per_second == 0 {
        return Err(CaptureError::internal(format!(
            "source link reports a non-audio format: {}ch @ {}Hz",
            source.channels, source.frames_per_second
        )));
    }
    let source_channels = source.channels as usize;
    let dest_channels = dest.channels as usize;
    if source.frames_per_second == dest.frames_per_second {
        tracing::trace!(
            rate = source.frames_per_second,
            "selected point sampler"
        );
        Ok(Box::new(PointSampler::new(source_channels, dest_channels)))
    } else {
        tracing::trace!(
            source_rate = source.frames_per_second,
            dest_rate = dest.frames_per_second,
            "selected linear sampler"
        );
        Ok(Box::new(LinearSampler::new(source_channels, dest_channels)))
    }
}

/// Maps one source frame onto a destination channel.
///
/// Matching layouts pass through; mono fans out to every destination
/// channel; everything else averages the source channels (the same policy
/// as downmixing to mono).
pub(crate) fn channel_value(frame: &[f32], dest_channel: usize, dest_channels: usize) -> f32 {
    let source_channels = frame.len();
    if source_channels == dest_channels {
        frame[dest_channel]
    } else if source_channels == 1 {
        frame[0]
    } else {
        frame.iter().sum::<f32>() / source_channels as f32
    }
}

/// Writes or accumulates one destination frame.
pub(crate) fn produce_frame(
    dest: &mut [f32],
    dest_offset: usize,
    dest_channels: usize,
    frame: &[f32],
    amplitude: f32,
    accumulate: bool,
) {
    let base = dest_offset * dest_channels;
    for channel in 0..dest_channels {
        let value = channel_value(frame, channel, dest_channels) * amplitude;
        if accumulate {
            dest[base + channel] += value;
        } else {
            dest[base + channel] = value;
        }
    }
}

/// Returns the region length in whole frames.
pub(crate) fn region_frames(frac_source_frames: u32) -> usize {
    (frac_source_frames >> FRAC_BITS) as usize
}
