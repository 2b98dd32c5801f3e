//! Delivered capture packets.

/// A completed region of the payload buffer, delivered to the client.
///
/// The packet describes *where* in the shared region the mixed audio lives;
/// the client reads the bytes back through its own
/// [`SharedRegion`](crate::SharedRegion) handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturePacket {
    /// First frame of the region within the payload buffer.
    pub offset_frames: u32,

    /// Number of frames actually filled.
    ///
    /// May be less than the requested length when the buffer was flushed or
    /// async capture was stopped mid-fill; may be zero for a flushed buffer
    /// that never reached the mixer.
    pub num_frames: u32,

    /// Monotonic nanoseconds of the region's first frame.
    ///
    /// `None` if the buffer was flushed out before any frame was mixed.
    pub timestamp: Option<i64>,

    /// `true` if this packet is not timeline-continuous with the previous
    /// one (first packet after startup, flush, or an async stop).
    pub discontinuous: bool,

    /// Monotonically increasing per-session sequence number.
    pub sequence_number: u64,
}

impl CapturePacket {
    /// Returns `true` if the packet carries no frames.
    pub fn is_empty(&self) -> bool {
        self.num_frames == 0
    }
}
