//! Error types for capture-mix.
//!
//! Errors are split by policy, not just by kind:
//! - Parameter-validation errors ([`CaptureError::InvalidArgument`]) are
//!   reported to the caller without side effects.
//! - Protocol violations during active operation ([`CaptureError::InvalidState`]
//!   on most calls) additionally shut the session down; a confused client is
//!   not allowed to keep driving a real-time resource.
//! - Timeline overflow and broken invariants are always fatal to the session.

use crate::capture::CaptureState;

/// Errors returned by capturer operations.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// A request parameter was malformed (buffer geometry, frame rate,
    /// channel count, packet size).
    ///
    /// Reported without side effects; the session keeps running.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the request.
        reason: String,
    },

    /// The operation is not legal in the session's current state.
    ///
    /// For most operations this is a protocol violation and the session is
    /// shut down as a side effect of returning this error.
    #[error("{operation} not legal in state {state:?}")]
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The state the session was in.
        state: CaptureState,
    },

    /// Allocation failed for buffer bookkeeping or a mapping.
    #[error("resource exhausted: {resource}")]
    ResourceExhausted {
        /// Which bounded resource ran out.
        resource: &'static str,
    },

    /// Timeline arithmetic overflowed the representable range.
    ///
    /// Always fatal to the session: once the time bookkeeping can no longer
    /// be trusted, neither can the buffers.
    #[error("timeline arithmetic overflow")]
    Overflow,

    /// An internal invariant was violated.
    #[error("internal error: {reason}")]
    Internal {
        /// Description of the broken invariant.
        reason: String,
    },
}

impl CaptureError {
    /// Creates an [`CaptureError::InvalidArgument`] with the given reason.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Creates an [`CaptureError::Internal`] with the given reason.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error is fatal to the session when raised
    /// during active operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Overflow | Self::Internal { .. })
    }
}
