//! Per-link bookkeeping.

use parking_lot::Mutex;
use std::sync::Arc;

use super::{CaptureSource, LinkId};
use crate::gain::Gain;
use crate::mix::{Bookkeeping, Mixer};
use crate::timeline::TimelineFunction;

/// The capturer's end of one capturer↔source relationship.
///
/// Created when a source is linked, destroyed when unlinked. The mixer is
/// selected lazily, the first time the link is visited while both the
/// source's and the capturer's formats are known, and reselected never:
/// formats are immutable once set.
pub(crate) struct SourceLink {
    pub(crate) id: LinkId,
    pub(crate) source: Arc<dyn CaptureSource>,
    /// Destination-stage gain for this link.
    pub(crate) gain: Gain,
    /// Mix-context state. Only the mixing context and unlink touch this, so
    /// contention is nil; the lock exists for ownership, not throughput.
    pub(crate) mix_state: Mutex<LinkMixState>,
}

impl SourceLink {
    pub(crate) fn new(id: LinkId, source: Arc<dyn CaptureSource>) -> Arc<Self> {
        Arc::new(Self {
            id,
            source,
            gain: Gain::new(),
            mix_state: Mutex::new(LinkMixState::new()),
        })
    }
}

impl std::fmt::Debug for SourceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceLink")
            .field("id", &self.id)
            .field("source", &self.source.name())
            .finish()
    }
}

/// Cached mixing state for one link.
pub(crate) struct LinkMixState {
    /// Selected once both formats are known; `None` means "skip silently".
    pub mixer: Option<Box<dyn Mixer>>,
    /// Rate-conversion stepping state, rebuilt at mixer selection.
    pub bookkeeping: Bookkeeping,
    /// Cached monotonic→fractional-source-frame transform.
    pub frac_transform: TimelineFunction,
    /// Cached monotonic→source-frame transform (integral).
    pub frame_transform: TimelineFunction,
    /// Generation of the cached transforms; refreshed when the source's
    /// counter moves.
    pub generation: Option<u64>,
}

impl LinkMixState {
    fn new() -> Self {
        Self {
            mixer: None,
            bookkeeping: Bookkeeping::default(),
            frac_transform: TimelineFunction::invalid(),
            frame_transform: TimelineFunction::invalid(),
            generation: None,
        }
    }
}
