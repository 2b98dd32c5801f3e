//! Notifications delivered to the control context.
//!
//! Packets and events are posted from the mixing context as fire-and-forget
//! tasks and invoked from a dedicated delivery task, never from the
//! real-time path and never under a lock.

use std::sync::Arc;

use crate::packet::CapturePacket;

/// Session-level notifications.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// The current run of packets has ended (flush completed or async
    /// capture stopped). The next packet will be flagged discontinuous.
    EndOfStream,

    /// The session shut down abnormally.
    ///
    /// Emitted for protocol violations and fatal mixing errors; a clean
    /// [`Capturer::shutdown`](crate::Capturer::shutdown) does not produce it.
    ShutDown {
        /// Why the session was torn down.
        reason: String,
    },
}

/// Callback type for delivered packets.
pub type PacketCallback = Arc<dyn Fn(CapturePacket) + Send + Sync>;

/// Callback type for session events.
pub type EventCallback = Arc<dyn Fn(CaptureEvent) + Send + Sync>;

/// Per-buffer completion callback, invoked instead of the session-wide
/// packet callback for the buffer it was enqueued with.
pub type CompletionCallback = Box<dyn FnOnce(CapturePacket) + Send>;

/// Callback invoked once an async-capture stop has fully drained.
pub type StopCallback = Box<dyn FnOnce() + Send>;

/// Creates a [`PacketCallback`] from a closure.
pub fn packet_callback<F>(f: F) -> PacketCallback
where
    F: Fn(CapturePacket) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Creates an [`EventCallback`] from a closure.
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(CaptureEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}
