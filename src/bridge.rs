//! Control-context delivery task.
//!
//! The mixing loop never calls into client code and never blocks on the
//! control context: completed work is posted onto an unbounded channel and
//! a dedicated task drains it, invoking client callbacks outside any lock.
//! The task holds its own strong reference to the shared session state, so
//! the session cannot be destroyed while a posted continuation is
//! outstanding.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::capture::engine::Shared;
use crate::capture::CaptureState;
use crate::event::{CaptureEvent, EventCallback, PacketCallback, StopCallback};

/// Work posted from the mixing context to the control context.
pub(crate) enum Delivery {
    /// Take the finished list and deliver each buffer; optionally follow
    /// with an end-of-stream notification.
    Drain { end_of_stream: bool },
    /// Complete an async-capture stop: return the session to sync mode and
    /// invoke the stop callback.
    StopComplete { callback: Option<StopCallback> },
    /// The session shut down abnormally.
    ShutDown { reason: String },
    /// The mixing domain has released its resources; drain and exit.
    Exit,
}

/// Runs the delivery task until the mixing domain exits.
pub(crate) async fn run_delivery(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    on_packet: Option<PacketCallback>,
    on_event: Option<EventCallback>,
) {
    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Drain { end_of_stream } => {
                // Atomic takeover of the finished list; the lock is not
                // held while callbacks run.
                let buffers = shared.inner.lock().queues.take_finished();
                let count = buffers.len();
                for mut buffer in buffers {
                    let packet = buffer.packet();
                    shared.stats.packets_produced.fetch_add(1, Ordering::Relaxed);
                    if let Some(completion) = buffer.completion.take() {
                        completion(packet);
                    } else if let Some(callback) = &on_packet {
                        callback(packet);
                    }
                }
                if count > 0 {
                    tracing::trace!(count, end_of_stream, "packets delivered");
                }
                if end_of_stream {
                    if let Some(callback) = &on_event {
                        callback(CaptureEvent::EndOfStream);
                    }
                }
            }
            Delivery::StopComplete { callback } => {
                {
                    let mut inner = shared.inner.lock();
                    if inner.state == CaptureState::StoppingCallbackPending {
                        inner.state = CaptureState::OperatingSync;
                    }
                }
                shared.wake.notify_one();
                if let Some(callback) = callback {
                    callback();
                }
            }
            Delivery::ShutDown { reason } => {
                if let Some(callback) = &on_event {
                    callback(CaptureEvent::ShutDown { reason });
                }
            }
            Delivery::Exit => break,
        }
    }
    tracing::debug!("delivery task exited");
}
