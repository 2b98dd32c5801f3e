//! Capture session state machine.

/// Capture session lifecycle state.
///
/// State transitions:
/// ```text
/// AwaitingBuffer → OperatingSync ⇄ OperatingAsync → Stopping
///                        ↑                             ↓
///                        └──── StoppingCallbackPending ┘
///
/// any state → ShutDown (terminal)
/// ```
///
/// Transitions are driven from both execution contexts: client requests
/// move `AwaitingBuffer → OperatingSync` (buffer attached) and
/// `OperatingSync → OperatingAsync` (async armed); the mixing loop drives
/// the stop sequence; either context may force `ShutDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Initial state: format is fixed but no payload buffer is attached.
    /// No mixing occurs.
    AwaitingBuffer,
    /// The client supplies discrete capture buffers via enqueue.
    OperatingSync,
    /// The mixing loop self-generates capture buffers of a configured size.
    OperatingAsync,
    /// An async stop has been requested; the mixing loop will wind down on
    /// its next wake.
    Stopping,
    /// Stop-side deliveries have been posted; awaiting the control context
    /// to invoke the stop callback and return the session to sync mode.
    StoppingCallbackPending,
    /// Terminal: all resources released.
    ShutDown,
}

impl CaptureState {
    /// Returns `true` in either operating mode.
    pub fn is_operating(&self) -> bool {
        matches!(self, Self::OperatingSync | Self::OperatingAsync)
    }

    /// Returns `true` once the session has been torn down.
    pub fn is_shut_down(&self) -> bool {
        matches!(self, Self::ShutDown)
    }
}
