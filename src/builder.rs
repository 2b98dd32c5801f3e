//! Builder for capture sessions.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::bridge;
use crate::capture::engine::{self, Inner, Shared, Stats};
use crate::capture::queue::BufferPool;
use crate::capturer::Capturer;
use crate::clock::{MonotonicClock, TokioClock};
use crate::event::{EventCallback, PacketCallback};
use crate::format::Format;
use crate::gain::Gain;
use crate::packet::CapturePacket;

/// Default capacity of the pending-buffer bookkeeping pool.
const DEFAULT_POOL_CAPACITY: usize = 256;

/// Builds a [`Capturer`].
///
/// # Example
///
/// ```no_run
/// use capture_mix::{Capturer, Format, SampleFormat};
///
/// # async fn example() {
/// let format = Format::new(SampleFormat::I16, 1, 48000).unwrap();
/// let capturer = Capturer::builder(format)
///     .on_packet(|packet| {
///         tracing::info!(?packet, "packet produced");
///     })
///     .on_event(|event| {
///         tracing::warn!(?event, "capture event");
///     })
///     .spawn();
/// # capturer.shutdown().await;
/// # }
/// ```
pub struct CapturerBuilder {
    format: Format,
    on_packet: Option<PacketCallback>,
    on_event: Option<EventCallback>,
    clock: Option<Arc<dyn MonotonicClock>>,
    pool_capacity: usize,
}

impl CapturerBuilder {
    pub(crate) fn new(format: Format) -> Self {
        Self {
            format,
            on_packet: None,
            on_event: None,
            clock: None,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }

    /// Sets the session-wide packet callback.
    ///
    /// Invoked from the delivery task for every produced packet that does
    /// not carry its own completion callback.
    pub fn on_packet<F>(mut self, f: F) -> Self
    where
        F: Fn(CapturePacket) + Send + Sync + 'static,
    {
        self.on_packet = Some(Arc::new(f));
        self
    }

    /// Sets the session event callback (end-of-stream, shutdown).
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(crate::CaptureEvent) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(f));
        self
    }

    /// Overrides the monotonic clock. Defaults to [`TokioClock`].
    pub fn clock(mut self, clock: Arc<dyn MonotonicClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Overrides the bounded pending-buffer pool capacity.
    pub fn pending_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity.max(1);
        self
    }

    /// Spawns the mixing and delivery tasks and returns the control handle.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(self) -> Capturer {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(TokioClock::new()) as Arc<dyn MonotonicClock>);
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            format: self.format,
            clock,
            pool: BufferPool::new(self.pool_capacity),
            inner: Mutex::new(Inner::new()),
            links: Mutex::new(Vec::new()),
            gain: Gain::new(),
            wake: Notify::new(),
            delivery_tx,
            stats: Stats::default(),
            next_link_id: AtomicU64::new(0),
        });

        let mix_handle = tokio::spawn(engine::run(shared.clone()));
        let delivery_handle = tokio::spawn(bridge::run_delivery(
            shared.clone(),
            delivery_rx,
            self.on_packet,
            self.on_event,
        ));

        tracing::info!(
            channels = self.format.channels,
            frames_per_second = self.format.frames_per_second,
            "capture session created"
        );
        Capturer::new(shared, mix_handle, delivery_handle)
    }
}
