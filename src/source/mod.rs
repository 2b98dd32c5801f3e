//! Audio sources and per-source link bookkeeping.
//!
//! A source enters the capturer through the [`CaptureSource`] trait: it
//! exposes a clock-indexed ring of frames, a transform from monotonic time
//! to its own frame position, and a source-stage gain. The capturer keeps a
//! [`SourceLink`](link::SourceLink) per attached source carrying the lazily
//! selected mixer and cached transform state.

pub(crate) mod link;
mod mock;
mod ring;

pub use mock::MockSource;
pub use ring::SourceRing;

use std::sync::Arc;

use crate::format::Format;
use crate::gain::Gain;
use crate::timeline::TimelineFunction;

/// How a source produces audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    /// Ring-buffer backed: the source writes continuously at positions
    /// driven by its clock. The only type this mixing strategy consumes.
    Continuous,
    /// Packet backed: excluded from ring mixing; such links may exist but
    /// never contribute samples.
    Packet,
}

/// A live audio source attached to the capturer.
///
/// Implementations are driven by hardware, a virtual device, or a test
/// double ([`MockSource`]); the capturer only ever reads.
pub trait CaptureSource: Send + Sync {
    /// A short identifier for logging.
    fn name(&self) -> &str;

    /// How this source produces audio.
    fn source_type(&self) -> SourceType;

    /// The source's stream format, once known.
    ///
    /// A source may be linked before its format is chosen; the capturer
    /// defers mixer selection and skips the link silently until this
    /// returns `Some`.
    fn format(&self) -> Option<Format>;

    /// The source's ring, if it has one yet.
    fn ring(&self) -> Option<Arc<SourceRing>>;

    /// The monotonic-nanoseconds → source-frame transform and its
    /// generation counter.
    ///
    /// A non-invertible transform means the source is not currently
    /// producing; the link is skipped. The generation moves whenever the
    /// mapping is re-anchored so the capturer can refresh its cache.
    fn position_transform(&self) -> (TimelineFunction, u64);

    /// The source-stage gain (device gain).
    fn gain(&self) -> &Gain;
}

/// Identifies one capturer↔source link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub(crate) u64);
