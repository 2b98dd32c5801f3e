//! The capturer handle: the control surface of a capture session.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::bridge::Delivery;
use crate::capture::engine::Shared;
use crate::capture::CaptureState;
use crate::error::CaptureError;
use crate::event::{CompletionCallback, StopCallback};
use crate::format::Format;
use crate::gain::Gain;
use crate::payload::{PayloadBuffer, SharedRegion};
use crate::source::link::SourceLink;
use crate::source::{CaptureSource, LinkId};
use crate::CapturerBuilder;

/// Statistics about a capture session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Packets delivered to the client.
    pub packets_produced: u64,
    /// Frames mixed into the payload buffer.
    pub frames_mixed: u64,
}

/// Handle to a running capture session.
///
/// All methods are control-context operations: they validate, mutate shared
/// state under a short-held lock, and signal the mixing loop; no mixing
/// work happens on the caller's thread.
///
/// # Lifecycle
///
/// 1. Created by [`CapturerBuilder::spawn`]
/// 2. [`attach_payload`](Capturer::attach_payload) supplies the shared
///    output region and enables capture
/// 3. Capture runs in sync mode (client-enqueued buffers) or async mode
///    (self-generated packets)
/// 4. [`shutdown`](Capturer::shutdown) for graceful teardown; dropping the
///    handle also requests shutdown
///
/// Most wrong-state calls are protocol violations: they return
/// [`CaptureError::InvalidState`] *and* shut the session down.
pub struct Capturer {
    shared: Arc<Shared>,
    mix_handle: Option<JoinHandle<()>>,
    delivery_handle: Option<JoinHandle<()>>,
}

impl Capturer {
    /// Starts building a capture session with the given destination format.
    pub fn builder(format: Format) -> CapturerBuilder {
        CapturerBuilder::new(format)
    }

    pub(crate) fn new(
        shared: Arc<Shared>,
        mix_handle: JoinHandle<()>,
        delivery_handle: JoinHandle<()>,
    ) -> Self {
        Self {
            shared,
            mix_handle: Some(mix_handle),
            delivery_handle: Some(delivery_handle),
        }
    }

    /// Returns the session's current state.
    pub fn state(&self) -> CaptureState {
        self.shared.inner.lock().state
    }

    /// Returns the session's destination format.
    pub fn format(&self) -> Format {
        self.shared.format
    }

    /// Returns current session statistics.
    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            packets_produced: self.shared.stats.packets_produced.load(Ordering::Relaxed),
            frames_mixed: self.shared.stats.frames_mixed.load(Ordering::Relaxed),
        }
    }

    /// Attaches the shared payload region and enables synchronous capture.
    ///
    /// Returns the region's capacity in frames. The region is mapped
    /// exactly once; attaching while a buffer is already attached is a
    /// protocol violation and shuts the session down.
    pub fn attach_payload(&self, region: Arc<SharedRegion>) -> Result<u32, CaptureError> {
        let mut inner = self.shared.inner.lock();
        if inner.state != CaptureState::AwaitingBuffer {
            let err = CaptureError::InvalidState {
                operation: "attach_payload",
                state: inner.state,
            };
            self.shared
                .begin_shutdown(&mut inner, "payload buffer re-attachment");
            return Err(err);
        }
        let payload = PayloadBuffer::map(region, &self.shared.format)?;
        let capacity = payload.frame_capacity();
        inner.scratch = vec![0.0; capacity as usize * self.shared.format.channels as usize];
        inner.payload = Some(payload);
        inner.state = CaptureState::OperatingSync;
        tracing::info!(frame_capacity = capacity, "payload buffer attached");
        Ok(capacity)
    }

    /// Enqueues a capture buffer covering `frames` frames at `offset`
    /// within the payload region.
    ///
    /// Returns the buffer's sequence number. Legal only in sync mode.
    pub fn enqueue(&self, offset: u32, frames: u32) -> Result<u64, CaptureError> {
        self.enqueue_inner(offset, frames, None)
    }

    /// Like [`enqueue`](Capturer::enqueue), with a per-buffer completion
    /// callback invoked instead of the session-wide packet callback.
    pub fn enqueue_with_callback(
        &self,
        offset: u32,
        frames: u32,
        completion: CompletionCallback,
    ) -> Result<u64, CaptureError> {
        self.enqueue_inner(offset, frames, Some(completion))
    }

    fn enqueue_inner(
        &self,
        offset: u32,
        frames: u32,
        completion: Option<CompletionCallback>,
    ) -> Result<u64, CaptureError> {
        let mut inner = self.shared.inner.lock();
        if inner.state != CaptureState::OperatingSync {
            let err = CaptureError::InvalidState {
                operation: "enqueue",
                state: inner.state,
            };
            self.shared
                .begin_shutdown(&mut inner, "enqueue outside synchronous capture");
            return Err(err);
        }
        if frames == 0 {
            return Err(CaptureError::invalid_argument(
                "capture length must be nonzero",
            ));
        }
        let capacity = inner
            .payload
            .as_ref()
            .map(PayloadBuffer::frame_capacity)
            .ok_or_else(|| CaptureError::internal("operating without a payload buffer"))?;
        if u64::from(offset) + u64::from(frames) > u64::from(capacity) {
            return Err(CaptureError::invalid_argument(format!(
                "range of {frames} frames at offset {offset} exceeds capacity {capacity}"
            )));
        }
        let slot = self.shared.pool.try_acquire()?;
        let (sequence, was_empty) = inner.queues.push_pending(slot, offset, frames, completion);
        drop(inner);
        if was_empty {
            self.shared.wake.notify_one();
        }
        Ok(sequence)
    }

    /// Releasing packets is not part of this capture model.
    ///
    /// Always fails; calling it is a protocol violation that shuts the
    /// session down.
    pub fn release_packet(&self) -> Result<(), CaptureError> {
        let mut inner = self.shared.inner.lock();
        let err = CaptureError::InvalidState {
            operation: "release_packet",
            state: inner.state,
        };
        self.shared
            .begin_shutdown(&mut inner, "release_packet is not supported");
        Err(err)
    }

    /// Flushes every pending and finished buffer to the client, regardless
    /// of fill level, followed by an end-of-stream notification.
    ///
    /// Legal only in sync mode; flushing during async capture is a
    /// protocol violation. Flushing an empty queue succeeds and delivers
    /// nothing; flushing twice in a row is safe.
    pub fn flush(&self) -> Result<(), CaptureError> {
        let mut inner = self.shared.inner.lock();
        if inner.state != CaptureState::OperatingSync {
            let err = CaptureError::InvalidState {
                operation: "flush",
                state: inner.state,
            };
            self.shared
                .begin_shutdown(&mut inner, "flush outside synchronous capture");
            return Err(err);
        }
        let moved = inner.queues.flush_all_to_finished();
        inner.timeline_reset = true;
        drop(inner);
        self.shared.wake.notify_one();
        if moved {
            self.shared.post(Delivery::Drain {
                end_of_stream: true,
            });
        }
        Ok(())
    }

    /// Switches to asynchronous capture with self-generated packets of
    /// `frames_per_packet` frames.
    ///
    /// Requires sync mode, empty queues, and a packet size that leaves room
    /// for at least two packets in the payload buffer. Failures leave the
    /// session state unchanged.
    pub fn start_async(&self, frames_per_packet: u32) -> Result<(), CaptureError> {
        let mut inner = self.shared.inner.lock();
        if inner.state != CaptureState::OperatingSync {
            return Err(CaptureError::InvalidState {
                operation: "start_async",
                state: inner.state,
            });
        }
        if !inner.queues.is_empty() {
            return Err(CaptureError::invalid_argument(
                "pending or finished buffers outstanding",
            ));
        }
        if frames_per_packet == 0 {
            return Err(CaptureError::invalid_argument(
                "frames_per_packet must be nonzero",
            ));
        }
        let capacity = inner
            .payload
            .as_ref()
            .map(PayloadBuffer::frame_capacity)
            .ok_or_else(|| CaptureError::internal("operating without a payload buffer"))?;
        if u64::from(frames_per_packet) > u64::from(capacity) / 2 {
            return Err(CaptureError::invalid_argument(format!(
                "frames_per_packet {frames_per_packet} leaves no room for two packets \
                 in a {capacity}-frame buffer"
            )));
        }
        inner.frames_per_packet = frames_per_packet;
        inner.next_async_offset = 0;
        inner.state = CaptureState::OperatingAsync;
        drop(inner);
        self.shared.wake.notify_one();
        tracing::info!(frames_per_packet, "async capture started");
        Ok(())
    }

    /// Requests that asynchronous capture stop.
    ///
    /// The mixing loop winds down on its next wake: partially filled
    /// packets are delivered, empty ones discarded, and the session returns
    /// to sync mode after an end-of-stream notification. Stopping while
    /// already synchronous is a harmless no-op.
    pub fn stop_async(&self) -> Result<(), CaptureError> {
        self.stop_async_inner(None)
    }

    /// Like [`stop_async`](Capturer::stop_async), invoking `callback` once
    /// the stop has fully drained.
    pub fn stop_async_with_callback(&self, callback: StopCallback) -> Result<(), CaptureError> {
        self.stop_async_inner(Some(callback))
    }

    fn stop_async_inner(&self, callback: Option<StopCallback>) -> Result<(), CaptureError> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            CaptureState::OperatingAsync => {
                inner.state = CaptureState::Stopping;
                inner.stop_callback = callback;
                drop(inner);
                self.shared.wake.notify_one();
                Ok(())
            }
            // Already synchronous (or already winding down): idempotent.
            // The callback is still posted so the client always hears back.
            CaptureState::OperatingSync
            | CaptureState::Stopping
            | CaptureState::StoppingCallbackPending => {
                drop(inner);
                self.shared.post(Delivery::StopComplete { callback });
                Ok(())
            }
            state => {
                let err = CaptureError::InvalidState {
                    operation: "stop_async",
                    state,
                };
                self.shared
                    .begin_shutdown(&mut inner, "stop_async before operation");
                Err(err)
            }
        }
    }

    /// Sets the capturer's stream gain in dB, clamped to the valid range.
    pub fn set_gain_db(&self, db: f32) {
        self.shared.gain.set_db(db);
        tracing::debug!(db = self.shared.gain.db(), "capturer gain set");
    }

    /// Mutes or unmutes the capturer. Muted capture still produces packets,
    /// filled with silence.
    pub fn set_mute(&self, muted: bool) {
        self.shared.gain.set_muted(muted);
        tracing::debug!(muted, "capturer mute set");
    }

    /// Attaches a source. Legal in any state before shutdown; a source
    /// whose format is not yet known is linked and skipped silently until
    /// the format appears.
    pub fn link_source(&self, source: Arc<dyn CaptureSource>) -> Result<LinkId, CaptureError> {
        {
            let inner = self.shared.inner.lock();
            if inner.state.is_shut_down() {
                return Err(CaptureError::InvalidState {
                    operation: "link_source",
                    state: inner.state,
                });
            }
        }
        let id = LinkId(self.shared.next_link_id.fetch_add(1, Ordering::Relaxed));
        let name = source.name().to_string();
        self.shared.links.lock().push(SourceLink::new(id, source));
        tracing::info!(source = %name, ?id, "source linked");
        Ok(id)
    }

    /// Detaches a source, destroying its link bookkeeping.
    pub fn unlink_source(&self, id: LinkId) -> Result<(), CaptureError> {
        let mut links = self.shared.links.lock();
        let before = links.len();
        links.retain(|link| link.id != id);
        if links.len() == before {
            return Err(CaptureError::invalid_argument(format!(
                "no source linked with {id:?}"
            )));
        }
        tracing::info!(?id, "source unlinked");
        Ok(())
    }

    /// Sets the destination-stage gain of one link, in dB.
    pub fn set_link_gain_db(&self, id: LinkId, db: f32) -> Result<(), CaptureError> {
        let links = self.shared.links.lock();
        let link = links.iter().find(|link| link.id == id).ok_or_else(|| {
            CaptureError::invalid_argument(format!("no source linked with {id:?}"))
        })?;
        link.gain.set_db(db);
        Ok(())
    }

    /// Returns a reference to the capturer's stream gain.
    pub fn gain(&self) -> &Gain {
        &self.shared.gain
    }

    /// Gracefully shuts the session down.
    ///
    /// Deactivates the mixing domain and waits for any in-flight mix
    /// iteration to complete before shared memory is released, then waits
    /// for the delivery task to drain.
    pub async fn shutdown(mut self) {
        {
            let mut inner = self.shared.inner.lock();
            if !inner.state.is_shut_down() {
                tracing::info!("capture session shutdown requested");
                inner.state = CaptureState::ShutDown;
            }
        }
        self.shared.wake.notify_one();
        if let Some(handle) = self.mix_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.delivery_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Capturer {
    fn drop(&mut self) {
        // Dropped without an explicit shutdown: request cooperative
        // teardown; the background tasks finish on their own.
        let mut inner = self.shared.inner.lock();
        if !inner.state.is_shut_down() {
            inner.state = CaptureState::ShutDown;
            drop(inner);
            self.shared.wake.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;
    use crate::source::MockSource;

    fn format() -> Format {
        Format::new(SampleFormat::I16, 1, 48000).unwrap()
    }

    fn region_for_frames(frames: usize) -> Arc<SharedRegion> {
        SharedRegion::allocate(frames * format().bytes_per_frame())
    }

    #[tokio::test]
    async fn test_attach_transitions_to_sync() {
        let capturer = Capturer::builder(format()).spawn();
        assert_eq!(capturer.state(), CaptureState::AwaitingBuffer);

        let capacity = capturer.attach_payload(region_for_frames(1000)).unwrap();
        assert_eq!(capacity, 1000);
        assert_eq!(capturer.state(), CaptureState::OperatingSync);
        capturer.shutdown().await;
    }

    #[tokio::test]
    async fn test_attach_rejects_bad_geometry_without_side_effects() {
        let capturer = Capturer::builder(format()).spawn();
        // One byte cannot hold a 2-byte frame.
        let err = capturer.attach_payload(SharedRegion::allocate(1)).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidArgument { .. }));
        // Parameter validation does not kill the session.
        assert_eq!(capturer.state(), CaptureState::AwaitingBuffer);

        assert!(capturer.attach_payload(region_for_frames(10)).is_ok());
        capturer.shutdown().await;
    }

    #[tokio::test]
    async fn test_reattach_is_fatal() {
        let capturer = Capturer::builder(format()).spawn();
        capturer.attach_payload(region_for_frames(100)).unwrap();

        let err = capturer
            .attach_payload(region_for_frames(100))
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidState { .. }));
        assert_eq!(capturer.state(), CaptureState::ShutDown);
        capturer.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_geometry_validation() {
        let capturer = Capturer::builder(format()).spawn();
        capturer.attach_payload(region_for_frames(1000)).unwrap();

        // Range exceeding capacity is rejected without side effects.
        let err = capturer.enqueue(990, 20).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidArgument { .. }));
        assert_eq!(capturer.state(), CaptureState::OperatingSync);

        assert!(capturer.enqueue(980, 20).is_ok());

        let err = capturer.enqueue(0, 0).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidArgument { .. }));
        assert_eq!(capturer.state(), CaptureState::OperatingSync);
        capturer.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_before_attach_is_fatal() {
        let capturer = Capturer::builder(format()).spawn();
        let err = capturer.enqueue(0, 100).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidState { .. }));
        assert_eq!(capturer.state(), CaptureState::ShutDown);
        capturer.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_async_validation_leaves_state_unchanged() {
        let capturer = Capturer::builder(format()).spawn();
        capturer.attach_payload(region_for_frames(1000)).unwrap();

        let err = capturer.start_async(0).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidArgument { .. }));
        assert_eq!(capturer.state(), CaptureState::OperatingSync);

        // 600 > 1000 / 2: no room for two packets.
        let err = capturer.start_async(600).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidArgument { .. }));
        assert_eq!(capturer.state(), CaptureState::OperatingSync);

        // 400 ≤ 500: accepted.
        capturer.start_async(400).unwrap();
        assert_eq!(capturer.state(), CaptureState::OperatingAsync);
        capturer.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_async_exact_half_capacity() {
        let capturer = Capturer::builder(format()).spawn();
        capturer.attach_payload(region_for_frames(1000)).unwrap();
        assert!(capturer.start_async(500).is_ok());
        capturer.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_during_async_is_fatal() {
        let capturer = Capturer::builder(format()).spawn();
        capturer.attach_payload(region_for_frames(1000)).unwrap();
        capturer.start_async(250).unwrap();

        let err = capturer.flush().unwrap_err();
        assert!(matches!(err, CaptureError::InvalidState { .. }));
        assert_eq!(capturer.state(), CaptureState::ShutDown);
        capturer.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_empty_queue_is_idempotent() {
        let capturer = Capturer::builder(format()).spawn();
        capturer.attach_payload(region_for_frames(1000)).unwrap();

        capturer.flush().unwrap();
        capturer.flush().unwrap();
        assert_eq!(capturer.state(), CaptureState::OperatingSync);
        capturer.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_async_while_sync_is_noop() {
        let capturer = Capturer::builder(format()).spawn();
        capturer.attach_payload(region_for_frames(1000)).unwrap();

        capturer.stop_async().unwrap();
        assert_eq!(capturer.state(), CaptureState::OperatingSync);
        capturer.shutdown().await;
    }

    #[tokio::test]
    async fn test_release_packet_always_fails() {
        let capturer = Capturer::builder(format()).spawn();
        capturer.attach_payload(region_for_frames(1000)).unwrap();

        let err = capturer.release_packet().unwrap_err();
        assert!(matches!(err, CaptureError::InvalidState { .. }));
        assert_eq!(capturer.state(), CaptureState::ShutDown);
        capturer.shutdown().await;
    }

    #[tokio::test]
    async fn test_link_and_unlink_source() {
        let capturer = Capturer::builder(format()).spawn();
        let source = MockSource::new("mic", format(), 480);

        let id = capturer.link_source(source).unwrap();
        capturer.set_link_gain_db(id, -6.0).unwrap();
        capturer.unlink_source(id).unwrap();

        let err = capturer.unlink_source(id).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidArgument { .. }));
        capturer.shutdown().await;
    }

    #[tokio::test]
    async fn test_gain_clamping_through_handle() {
        let capturer = Capturer::builder(format()).spawn();
        capturer.set_gain_db(1000.0);
        assert_eq!(capturer.gain().db(), crate::gain::MAX_GAIN_DB);
        capturer.shutdown().await;
    }
}
