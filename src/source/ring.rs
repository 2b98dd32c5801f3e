//! Clock-indexed source ring.

use parking_lot::RwLock;
use std::sync::Arc;

/// A fixed-size ring of interleaved f32 frames addressed by absolute frame
/// position.
///
/// The writer (a device callback or test driver) places frames at absolute
/// positions; position `p` lives in slot `p mod frame_count`. The capturer
/// derives which absolute positions are safely readable from the source's
/// clock transform and reads the corresponding slots; the ring itself
/// carries no read/write cursors.
#[derive(Debug)]
pub struct SourceRing {
    frames: RwLock<Vec<f32>>,
    frame_count: usize,
    channels: u16,
}

impl SourceRing {
    /// Allocates a zero-filled ring.
    pub fn new(frame_count: usize, channels: u16) -> Arc<Self> {
        Arc::new(Self {
            frames: RwLock::new(vec![0.0; frame_count * channels as usize]),
            frame_count,
            channels,
        })
    }

    /// Returns the ring size in frames.
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Returns the channel count of each frame.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Writes interleaved frames starting at an absolute position,
    /// wrapping at the ring boundary.
    pub fn write_at(&self, start_frame: i64, samples: &[f32]) {
        let channels = self.channels as usize;
        debug_assert_eq!(samples.len() % channels, 0);
        let mut frames = self.frames.write();
        for (i, frame) in samples.chunks_exact(channels).enumerate() {
            let slot = (start_frame + i as i64).rem_euclid(self.frame_count as i64) as usize;
            frames[slot * channels..(slot + 1) * channels].copy_from_slice(frame);
        }
    }

    /// Calls `f` with one linear run of `frames` frames starting at `slot`.
    ///
    /// The caller is responsible for splitting reads at the ring boundary;
    /// `slot + frames` must not exceed the ring size.
    pub(crate) fn with_frames<R>(&self, slot: usize, frames: usize, f: impl FnOnce(&[f32]) -> R) -> R {
        let channels = self.channels as usize;
        let guard = self.frames.read();
        f(&guard[slot * channels..(slot + frames) * channels])
    }
}
