//! The shared payload buffer.
//!
//! The client allocates a [`SharedRegion`] and hands it to the capturer,
//! which maps it exactly once and owns it until shutdown. All access goes
//! through bounds-checked frame-offset accessors; there is no raw offset
//! arithmetic anywhere near the mapped bytes. The client keeps its own
//! handle to read delivered regions.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::CaptureError;
use crate::format::{self, Format};

/// A shared byte region backing the payload buffer.
///
/// Created by the client, supplied to [`Capturer::attach_payload`], and read
/// back through [`SharedRegion::read_bytes`] when packets are delivered.
///
/// [`Capturer::attach_payload`]: crate::Capturer::attach_payload
#[derive(Debug)]
pub struct SharedRegion {
    bytes: RwLock<Vec<u8>>,
    byte_size: usize,
}

impl SharedRegion {
    /// Allocates a zero-filled region of the given byte size.
    pub fn allocate(byte_size: usize) -> Arc<Self> {
        Arc::new(Self {
            bytes: RwLock::new(vec![0u8; byte_size]),
            byte_size,
        })
    }

    /// Returns the region's size in bytes.
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Copies out `len` bytes starting at `byte_offset`.
    ///
    /// Fails with `InvalidArgument` if the range exceeds the region.
    pub fn read_bytes(&self, byte_offset: usize, len: usize) -> Result<Vec<u8>, CaptureError> {
        let end = byte_offset
            .checked_add(len)
            .filter(|&end| end <= self.byte_size)
            .ok_or_else(|| {
                CaptureError::invalid_argument(format!(
                    "read of {len} bytes at offset {byte_offset} exceeds region of {} bytes",
                    self.byte_size
                ))
            })?;
        Ok(self.bytes.read()[byte_offset..end].to_vec())
    }

    fn write_bytes(&self, byte_offset: usize, f: impl FnOnce(&mut [u8])) {
        let mut bytes = self.bytes.write();
        f(&mut bytes[byte_offset..]);
    }
}

/// The capturer's mapped view of a [`SharedRegion`].
///
/// Holds the derived frame geometry; every write is validated against the
/// frame capacity before any byte moves.
#[derive(Debug, Clone)]
pub(crate) struct PayloadBuffer {
    region: Arc<SharedRegion>,
    frame_capacity: u32,
    bytes_per_frame: usize,
}

impl PayloadBuffer {
    /// Maps a region for the given format.
    ///
    /// Rejects regions smaller than one frame and regions whose frame count
    /// does not fit in 32 bits.
    pub(crate) fn map(region: Arc<SharedRegion>, format: &Format) -> Result<Self, CaptureError> {
        let bytes_per_frame = format.bytes_per_frame();
        let byte_size = region.byte_size();
        if byte_size < bytes_per_frame {
            return Err(CaptureError::invalid_argument(format!(
                "region of {byte_size} bytes holds less than one {bytes_per_frame}-byte frame"
            )));
        }
        let frames = byte_size / bytes_per_frame;
        let frame_capacity = u32::try_from(frames).map_err(|_| {
            CaptureError::invalid_argument(format!(
                "region of {byte_size} bytes holds {frames} frames; frame count must fit in 32 bits"
            ))
        })?;
        Ok(Self {
            region,
            frame_capacity,
            bytes_per_frame,
        })
    }

    /// Returns the capacity in frames.
    pub(crate) fn frame_capacity(&self) -> u32 {
        self.frame_capacity
    }

    /// Converts the scratch samples to the destination format and writes
    /// them at `frame_offset`.
    ///
    /// `scratch` holds `frames * channels` samples. Fails with
    /// `InvalidArgument` if the frame range exceeds capacity.
    pub(crate) fn write_frames(
        &self,
        frame_offset: u32,
        frames: u32,
        format: &Format,
        scratch: &[f32],
    ) -> Result<(), CaptureError> {
        let in_bounds = frame_offset
            .checked_add(frames)
            .is_some_and(|end| end <= self.frame_capacity);
        if !in_bounds {
            return Err(CaptureError::invalid_argument(format!(
                "write of {frames} frames at offset {frame_offset} exceeds capacity {}",
                self.frame_capacity
            )));
        }
        debug_assert_eq!(scratch.len(), frames as usize * format.channels as usize);
        let byte_offset = frame_offset as usize * self.bytes_per_frame;
        let byte_len = frames as usize * self.bytes_per_frame;
        self.region.write_bytes(byte_offset, |bytes| {
            format::write_scratch(&mut bytes[..byte_len], format.sample_format, scratch);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;

    fn format() -> Format {
        Format::new(SampleFormat::I16, 2, 48000).unwrap()
    }

    #[test]
    fn test_geometry_accepted() {
        // 4000 bytes / 4 bytes per frame = 1000 frames
        let region = SharedRegion::allocate(4000);
        let payload = PayloadBuffer::map(region, &format()).unwrap();
        assert_eq!(payload.frame_capacity(), 1000);
    }

    #[test]
    fn test_geometry_truncates_partial_frame() {
        let region = SharedRegion::allocate(4003);
        let payload = PayloadBuffer::map(region, &format()).unwrap();
        // Partial trailing frame is not counted.
        assert_eq!(payload.frame_capacity(), 1000);
        assert!(payload.frame_capacity() as usize * 4 <= 4003);
    }

    #[test]
    fn test_geometry_smaller_than_one_frame_rejected() {
        let region = SharedRegion::allocate(3);
        let err = PayloadBuffer::map(region, &format()).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidArgument { .. }));
    }

    #[test]
    fn test_single_frame_accepted() {
        let region = SharedRegion::allocate(4);
        let payload = PayloadBuffer::map(region, &format()).unwrap();
        assert_eq!(payload.frame_capacity(), 1);
    }

    #[test]
    fn test_write_bounds_checked() {
        let region = SharedRegion::allocate(4000);
        let payload = PayloadBuffer::map(region, &format()).unwrap();

        let scratch = vec![0.0f32; 20 * 2];
        assert!(payload.write_frames(980, 20, &format(), &scratch).is_ok());
        assert!(payload.write_frames(990, 20, &format(), &scratch).is_err());
        // Offset overflow is also a clean rejection.
        assert!(payload
            .write_frames(u32::MAX, 20, &format(), &scratch)
            .is_err());
    }

    #[test]
    fn test_write_lands_at_frame_offset() {
        let fmt = Format::new(SampleFormat::I16, 1, 48000).unwrap();
        let region = SharedRegion::allocate(20);
        let payload = PayloadBuffer::map(region.clone(), &fmt).unwrap();

        payload.write_frames(3, 2, &fmt, &[0.5, -0.5]).unwrap();

        let bytes = region.read_bytes(6, 4).unwrap();
        let v: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(v, vec![16383, -16383]);
    }

    #[test]
    fn test_region_read_bounds_checked() {
        let region = SharedRegion::allocate(16);
        assert!(region.read_bytes(12, 4).is_ok());
        assert!(region.read_bytes(12, 5).is_err());
        assert!(region.read_bytes(usize::MAX, 2).is_err());
    }
}
