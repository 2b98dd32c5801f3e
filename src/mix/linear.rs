//! Linear-interpolation mixer for rate-converting links.

use super::{channel_value, region_frames, Bookkeeping, Mixer};
use crate::timeline::{FRAC_BITS, FRAC_ONE};

/// Resamples with linear interpolation between adjacent source frames.
///
/// Fast and adequate for speech-grade capture; a higher-order filter can be
/// slotted in behind the same [`Mixer`] contract without touching the
/// engine. At the trailing edge of a region the last frame is held rather
/// than interpolated, matching the behavior of interpolating past the end
/// of available input.
#[derive(Debug)]
pub struct LinearSampler {
    source_channels: usize,
    dest_channels: usize,
}

impl LinearSampler {
    /// Creates a linear sampler for the given channel layouts.
    pub fn new(source_channels: usize, dest_channels: usize) -> Self {
        Self {
            source_channels,
            dest_channels,
        }
    }

    fn frame<'a>(&self, source: &'a [f32], index: usize) -> &'a [f32] {
        &source[index * self.source_channels..(index + 1) * self.source_channels]
    }
}

impl Mixer for LinearSampler {
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
    ) -> bool {
        debug_assert!(*frac_source_offset >= 0);
        let frames = region_frames(frac_source_frames);
        debug_assert_eq!(source.len(), frames * self.source_channels);

        let end = frac_source_frames as i64;
        let frac_mask = (FRAC_ONE - 1) as i32;
        while *dest_offset < dest_frames && i64::from(*frac_source_offset) < end {
            let index = (*frac_source_offset >> FRAC_BITS) as usize;
            let frac = f32::from((*frac_source_offset & frac_mask) as u16) / FRAC_ONE as f32;

            let lower = self.frame(source, index);
            let upper = if index + 1 < frames {
                self.frame(source, index + 1)
            } else {
                lower
            };

            let base = *dest_offset * self.dest_channels;
            for channel in 0..self.dest_channels {
                let v0 = channel_value(lower, channel, self.dest_channels);
                let v1 = channel_value(upper, channel, self.dest_channels);
                let value = (v0 + (v1 - v0) * frac) * bookkeeping.amplitude;
                if accumulate {
                    dest[base + channel] += value;
                } else {
                    dest[base + channel] = value;
                }
            }
            *dest_offset += 1;
            bookkeeping.advance_one(frac_source_offset);
        }
        i64::from(*frac_source_offset) >= end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frac(frames: usize) -> u32 {
        (frames as u32) << FRAC_BITS
    }

    fn run_mix(
        source_fps: u32,
        dest_fps: u32,
        source: &[f32],
        dest_frames: usize,
    ) -> (Vec<f32>, usize, bool) {
        let mut sampler = LinearSampler::new(1, 1);
        let mut bk = Bookkeeping::for_rates(source_fps, dest_fps);
        let mut dest = vec![0.0f32; dest_frames];
        let mut dest_offset = 0;
        let mut frac_offset = 0i32;
        let consumed = sampler.mix(
            &mut dest,
            dest_frames,
            &mut dest_offset,
            source,
            frac(source.len()),
            &mut frac_offset,
            true,
            &mut bk,
        );
        (dest, dest_offset, consumed)
    }

    #[test]
    fn test_upsample_2x_interpolates_midpoints() {
        let source = [0.0f32, 1.0, 0.0];
        let (dest, produced, _) = run_mix(24000, 48000, &source, 6);

        assert_eq!(produced, 6);
        assert!((dest[0] - 0.0).abs() < 1e-6);
        assert!((dest[1] - 0.5).abs() < 1e-6);
        assert!((dest[2] - 1.0).abs() < 1e-6);
        assert!((dest[3] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_downsample_3x_lands_on_samples() {
        let source: Vec<f32> = (0..9).map(|i| i as f32 / 10.0).collect();
        let (dest, produced, consumed) = run_mix(48000, 16000, &source, 3);

        assert_eq!(produced, 3);
        assert!(consumed);
        // Integral 3:1 ratio lands exactly on source frames 0, 3, 6.
        assert!((dest[0] - source[0]).abs() < 1e-6);
        assert!((dest[1] - source[3]).abs() < 1e-6);
        assert!((dest[2] - source[6]).abs() < 1e-6);
    }

    #[test]
    fn test_dest_fills_before_region_ends() {
        let source = [0.5f32; 100];
        let (_, produced, consumed) = run_mix(48000, 48000, &source, 10);
        assert_eq!(produced, 10);
        assert!(!consumed);
    }

    #[test]
    fn test_holds_last_frame_at_region_edge() {
        // 2x upsample of a 2-frame region: the last output interpolates past
        // frame 1 and must hold it instead of reading out of bounds.
        let source = [0.0f32, 0.8];
        let (dest, produced, _) = run_mix(24000, 48000, &source, 4);
        assert_eq!(produced, 4);
        assert!((dest[3] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_gain_applied() {
        let mut sampler = LinearSampler::new(1, 1);
        let mut bk = Bookkeeping::for_rates(48000, 48000);
        bk.amplitude = 0.25;
        let source = [1.0f32, 1.0];
        let mut dest = vec![0.0f32; 2];
        let mut dest_offset = 0;
        let mut frac_offset = 0i32;

        sampler.mix(
            &mut dest,
            2,
            &mut dest_offset,
            &source,
            frac(2),
            &mut frac_offset,
            true,
            &mut bk,
        );
        assert!((dest[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_irrational_ratio_produces_expected_count() {
        // One second of 44.1kHz input at a 48kHz output rate: the modulo
        // triple must consume all 44100 frames in exactly 48000 outputs.
        let source = vec![0.1f32; 44100];
        let (_, produced, consumed) = run_mix(44100, 48000, &source, 48000);
        assert_eq!(produced, 48000);
        assert!(consumed);
    }

    #[test]
    fn test_stereo_downmix_to_mono() {
        let mut sampler = LinearSampler::new(2, 1);
        let mut bk = Bookkeeping::for_rates(48000, 48000);
        let source = [0.2f32, 0.4, 0.6, 0.8];
        let mut dest = vec![0.0f32; 2];
        let mut dest_offset = 0;
        let mut frac_offset = 0i32;

        sampler.mix(
            &mut dest,
            2,
            &mut dest_offset,
            &source,
            frac(2),
            &mut frac_offset,
            true,
            &mut bk,
        );
        assert!((dest[0] - 0.3).abs() < 1e-6);
        assert!((dest[1] - 0.7).abs() < 1e-6);
    }
}
