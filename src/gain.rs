//! Gain and mute state.
//!
//! Gain is expressed in decibels and combined additively across stages
//! (source gain + link gain + capturer gain). A stage at or below the
//! silence threshold contributes exactly nothing to a mix: it is skipped,
//! not multiplied through, so a silent source adds no rounding noise.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Gain at or below this level is defined to be silence.
pub const MUTED_GAIN_DB: f32 = -160.0;

/// Unity gain.
pub const UNITY_GAIN_DB: f32 = 0.0;

/// Maximum settable gain.
pub const MAX_GAIN_DB: f32 = 24.0;

/// Converts decibels to a linear amplitude scale factor.
pub fn db_to_amplitude(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

/// A single gain stage: a dB level plus a mute flag.
///
/// Mutable from the control context while the mixing context reads it, so
/// the level sits behind a short-held lock and the flag is atomic.
#[derive(Debug)]
pub struct Gain {
    db: RwLock<f32>,
    muted: AtomicBool,
}

impl Gain {
    /// Creates a stage at unity gain, unmuted.
    pub fn new() -> Self {
        Self {
            db: RwLock::new(UNITY_GAIN_DB),
            muted: AtomicBool::new(false),
        }
    }

    /// Sets the gain, clamped to `[MUTED_GAIN_DB, MAX_GAIN_DB]`.
    pub fn set_db(&self, db: f32) {
        *self.db.write() = db.clamp(MUTED_GAIN_DB, MAX_GAIN_DB);
    }

    /// Returns the current gain in dB.
    pub fn db(&self) -> f32 {
        *self.db.read()
    }

    /// Sets the mute flag.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    /// Returns the mute flag.
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Returns the stage's effective dB, or `None` when muted or at the
    /// silence threshold.
    pub fn effective_db(&self) -> Option<f32> {
        if self.is_muted() {
            return None;
        }
        let db = self.db();
        (db > MUTED_GAIN_DB).then_some(db)
    }
}

impl Default for Gain {
    fn default() -> Self {
        Self::new()
    }
}

/// Combines gain stages additively in dB.
///
/// Returns the linear amplitude to mix with, or `None` if any stage is
/// muted or the combined level is at or below the silence threshold.
pub fn combined_amplitude(stages: &[&Gain]) -> Option<f32> {
    let mut total = 0.0f32;
    for stage in stages {
        total += stage.effective_db()?;
    }
    if total <= MUTED_GAIN_DB {
        return None;
    }
    Some(db_to_amplitude(total))
}
