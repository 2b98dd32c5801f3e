//! The mixing loop.
//!
//! One tokio task owns the mixing domain: it is the only writer of the
//! payload buffer and the only caller of mixers, so the real-time path is
//! serialized by construction. The loop re-evaluates session state from the
//! top after every action, sleeps on the wake signal when idle, and arms a
//! one-shot deadline when the head buffer's frames are not yet stable at
//! every source.
//!
//! The session lock is held only to inspect and mutate queue/state data,
//! never across a mix. A mix pass records the head buffer's sequence number
//! before releasing the lock and re-checks it when committing fill
//! progress, so a buffer flushed out mid-pass discards the result instead
//! of corrupting a delivered region.

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use crate::bridge::Delivery;
use crate::capture::queue::{BufferPool, QueueState};
use crate::capture::CaptureState;
use crate::clock::MonotonicClock;
use crate::error::CaptureError;
use crate::event::StopCallback;
use crate::format::Format;
use crate::gain::{self, Gain};
use crate::mix::{self, Bookkeeping, MAX_REGION_FRAMES};
use crate::payload::PayloadBuffer;
use crate::source::link::SourceLink;
use crate::source::SourceType;
use crate::timeline::{TimelineFunction, FRAC_BITS, NANOS_PER_SECOND};

/// Worst-case delay before a source's newest samples are stable/readable.
pub(crate) const FENCE_NANOS: i64 = 5_000_000;

/// Counters shared between the two contexts.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub packets_produced: AtomicU64,
    pub frames_mixed: AtomicU64,
}

/// State shared between the control and mixing contexts.
pub(crate) struct Shared {
    pub format: Format,
    pub clock: Arc<dyn MonotonicClock>,
    pub pool: Arc<BufferPool>,
    pub inner: Mutex<Inner>,
    pub links: Mutex<Vec<Arc<SourceLink>>>,
    /// Capturer-level (stream) gain.
    pub gain: Gain,
    pub wake: Notify,
    pub delivery_tx: mpsc::UnboundedSender<Delivery>,
    pub stats: Stats,
    pub next_link_id: AtomicU64,
}

/// Everything guarded by the short-held session lock.
pub(crate) struct Inner {
    pub state: CaptureState,
    pub queues: QueueState,
    pub payload: Option<PayloadBuffer>,
    /// f32 accumulation buffer, allocated when the payload is attached and
    /// borrowed by the mixing context for the duration of each pass.
    pub scratch: Vec<f32>,
    pub frames_per_packet: u32,
    pub next_async_offset: u32,
    pub stop_callback: Option<StopCallback>,
    /// Set by flush to break timeline continuity on the next wake.
    pub timeline_reset: bool,
}

impl Inner {
    pub(crate) fn new() -> Self {
        Self {
            state: CaptureState::AwaitingBuffer,
            queues: QueueState::new(),
            payload: None,
            scratch: Vec::new(),
            frames_per_packet: 0,
            next_async_offset: 0,
            stop_callback: None,
            timeline_reset: false,
        }
    }
}

impl Shared {
    /// Fire-and-forget post to the control context. Never blocks.
    pub(crate) fn post(&self, delivery: Delivery) {
        let _ = self.delivery_tx.send(delivery);
    }

    /// Forces the session into `ShutDown` (idempotent) and wakes the mixing
    /// loop so it can release resources.
    pub(crate) fn begin_shutdown(&self, inner: &mut Inner, reason: &str) {
        if inner.state.is_shut_down() {
            return;
        }
        tracing::warn!(reason, "shutting down capture session");
        inner.state = CaptureState::ShutDown;
        self.post(Delivery::ShutDown {
            reason: reason.to_string(),
        });
        self.wake.notify_one();
    }
}

/// What the decision loop chose to do on this evaluation.
enum Step {
    /// Re-evaluate immediately; one wake may complete several due buffers.
    Continue,
    /// Nothing to do until the next wake signal.
    Idle,
    /// The head buffer's frames are not yet stable; arm a one-shot timer.
    Wait(i64),
    /// The session is shut down; release resources and exit the domain.
    Exit,
}

/// Runs the mixing domain until shutdown. Spawned once per session.
pub(crate) async fn run(shared: Arc<Shared>) {
    let mut domain = MixDomain {
        shared,
        frames_to_mono: TimelineFunction::invalid(),
        frames_produced: 0,
        discontinuity: true,
    };
    loop {
        match domain.step() {
            Step::Continue => {}
            Step::Idle => domain.shared.wake.notified().await,
            Step::Wait(nanos) => {
                let deadline = Duration::from_nanos(nanos.max(0) as u64);
                tokio::select! {
                    _ = domain.shared.wake.notified() => {}
                    _ = tokio::time::sleep(deadline) => {}
                }
            }
            Step::Exit => break,
        }
    }
    domain.release();
}

struct MixDomain {
    shared: Arc<Shared>,
    /// Maps frames produced since operation start to monotonic nanoseconds.
    /// Invalidated on every continuity break; re-anchored at "now" when the
    /// next buffer starts filling.
    frames_to_mono: TimelineFunction,
    frames_produced: i64,
    /// Pending discontinuity flag for the next buffer that starts filling.
    discontinuity: bool,
}

impl MixDomain {
    fn step(&mut self) -> Step {
        let shared = self.shared.clone();
        let mut inner = shared.inner.lock();
        if inner.timeline_reset {
            inner.timeline_reset = false;
            self.frames_to_mono = TimelineFunction::invalid();
            self.discontinuity = true;
        }
        match inner.state {
            CaptureState::ShutDown => Step::Exit,
            CaptureState::AwaitingBuffer | CaptureState::StoppingCallbackPending => Step::Idle,
            CaptureState::Stopping => self.finish_stop(&mut inner),
            CaptureState::OperatingSync | CaptureState::OperatingAsync => self.operate(inner),
        }
    }

    /// Winds down async capture: partial buffers are kept, empty generated
    /// buffers discarded, and the stop sequence handed to the control
    /// context.
    fn finish_stop(&mut self, inner: &mut Inner) -> Step {
        let mut kept = 0usize;
        let mut discarded = 0usize;
        while let Some(buffer) = inner.queues.pending.pop_front() {
            if buffer.filled_frames > 0 {
                inner.queues.finished.push(buffer);
                kept += 1;
            } else {
                discarded += 1;
            }
        }
        self.frames_to_mono = TimelineFunction::invalid();
        self.discontinuity = true;
        inner.state = CaptureState::StoppingCallbackPending;
        let callback = inner.stop_callback.take();
        self.shared.post(Delivery::Drain {
            end_of_stream: true,
        });
        self.shared.post(Delivery::StopComplete { callback });
        tracing::debug!(kept, discarded, "async capture stopping");
        Step::Continue
    }

    fn operate(&mut self, mut inner: MutexGuard<'_, Inner>) -> Step {
        let is_async = inner.state == CaptureState::OperatingAsync;
        if inner.queues.pending.is_empty() {
            if is_async {
                return match self.synthesize_slot(&mut inner) {
                    Ok(()) => Step::Continue,
                    Err(err) => self.fatal(&mut inner, err),
                };
            }
            // Nothing to fill: break timeline continuity and idle until the
            // next enqueue or mode change.
            self.frames_to_mono = TimelineFunction::invalid();
            self.discontinuity = true;
            return Step::Idle;
        }

        if !self.frames_to_mono.is_invertible() {
            let now = self.shared.clock.now();
            self.frames_to_mono = TimelineFunction::new(
                now,
                self.frames_produced,
                NANOS_PER_SECOND,
                self.shared.format.frames_per_second,
            );
            tracing::debug!(
                anchor_nanos = now,
                anchor_frame = self.frames_produced,
                "capture timeline established"
            );
        }

        let Some(head) = inner.queues.pending.front() else {
            return Step::Idle;
        };
        let sequence = head.sequence_number;
        let dest_offset = head.offset_frames + head.filled_frames;
        let job_frames =
            (head.num_frames - head.filled_frames).min(self.shared.format.max_frames_per_mix());

        let job_end = self.frames_produced + i64::from(job_frames);
        // apply() floors; the deadline must never precede the instant the
        // job's last frame exists, so round up one nanosecond.
        let ready_at = match self.frames_to_mono.apply(job_end) {
            Ok(t) => t + 1 + FENCE_NANOS,
            Err(err) => return self.fatal(&mut inner, err),
        };
        let now = self.shared.clock.now();
        if ready_at > now {
            return Step::Wait(ready_at - now);
        }

        let Some(payload) = inner.payload.clone() else {
            return self.fatal(
                &mut inner,
                CaptureError::internal("operating without a payload buffer"),
            );
        };
        let t0 = match self.frames_to_mono.apply(self.frames_produced) {
            Ok(t) => t,
            Err(err) => return self.fatal(&mut inner, err),
        };
        let mut scratch = std::mem::take(&mut inner.scratch);
        drop(inner);

        let samples = job_frames as usize * self.shared.format.channels as usize;
        let result = self
            .mix_job(&mut scratch[..samples], job_frames, t0, now)
            .and_then(|()| {
                payload.write_frames(
                    dest_offset,
                    job_frames,
                    &self.shared.format,
                    &scratch[..samples],
                )
            });

        let shared = self.shared.clone();
        let mut inner = shared.inner.lock();
        inner.scratch = scratch;
        if let Err(err) = result {
            return self.fatal(&mut inner, err);
        }
        self.commit(&mut inner, sequence, job_frames, t0);
        Step::Continue
    }

    /// Applies fill progress for a completed mix, unless the buffer was
    /// flushed out from under the pass.
    fn commit(&mut self, inner: &mut Inner, sequence: u64, job_frames: u32, t0: i64) {
        match inner.queues.pending.front_mut() {
            Some(head) if head.sequence_number == sequence => {
                if head.capture_timestamp.is_none() {
                    head.capture_timestamp = Some(t0);
                    head.discontinuous = self.discontinuity;
                    self.discontinuity = false;
                }
                head.filled_frames += job_frames;
                self.frames_produced += i64::from(job_frames);
                self.shared
                    .stats
                    .frames_mixed
                    .fetch_add(u64::from(job_frames), Ordering::Relaxed);

                if head.filled_frames == head.num_frames {
                    if let Some(buffer) = inner.queues.pending.pop_front() {
                        let first_finished = inner.queues.finished.is_empty();
                        inner.queues.finished.push(buffer);
                        if first_finished {
                            self.shared.post(Delivery::Drain {
                                end_of_stream: false,
                            });
                        }
                    }
                }
            }
            _ => {
                // The region was already delivered by the flush; the mix
                // result is simply discarded.
                tracing::debug!(sequence, "mix result discarded after flush");
            }
        }
    }

    /// Generates the next async capture buffer, ping-ponging through the
    /// payload when the next slot would not fit contiguously.
    fn synthesize_slot(&mut self, inner: &mut Inner) -> Result<(), CaptureError> {
        let capacity = inner
            .payload
            .as_ref()
            .map(PayloadBuffer::frame_capacity)
            .ok_or_else(|| CaptureError::internal("async capture without a payload buffer"))?;
        let frames = inner.frames_per_packet;
        let mut offset = inner.next_async_offset;
        if u64::from(offset) + u64::from(frames) > u64::from(capacity) {
            offset = 0;
        }
        let slot = self.shared.pool.try_acquire()?;
        inner.queues.push_pending(slot, offset, frames, None);
        inner.next_async_offset = offset + frames;
        Ok(())
    }

    /// One job's worth of mixing: zero the scratch region, then let every
    /// audible continuous source accumulate into it.
    fn mix_job(
        &mut self,
        scratch: &mut [f32],
        frames: u32,
        t0: i64,
        now: i64,
    ) -> Result<(), CaptureError> {
        scratch.fill(0.0);
        if gain::combined_amplitude(&[&self.shared.gain]).is_none() {
            // Muted capturer: silence is still a validly produced region.
            return Ok(());
        }

        // Stable, order-preserving snapshot of the continuous links.
        let snapshot: Vec<Arc<SourceLink>> = {
            let links = self.shared.links.lock();
            links
                .iter()
                .filter(|link| link.source.source_type() == SourceType::Continuous)
                .cloned()
                .collect()
        };

        let mut first = true;
        for link in &snapshot {
            let contributed = self.mix_link(link, scratch, frames, t0, now, !first)?;
            if contributed {
                first = false;
            }
        }
        Ok(())
    }

    fn mix_link(
        &self,
        link: &SourceLink,
        scratch: &mut [f32],
        frames: u32,
        t0: i64,
        now: i64,
        accumulate: bool,
    ) -> Result<bool, CaptureError> {
        let source = &*link.source;
        let Some(ring) = source.ring() else {
            return Ok(false);
        };

        let mut state = link.mix_state.lock();
        if state.mixer.is_none() {
            // Mixer selection is deferred until the source's format is
            // known; a format-less link is skipped, not an error.
            let Some(source_format) = source.format() else {
                return Ok(false);
            };
            let mixer = mix::select_mixer(&source_format, &self.shared.format)?;
            state.bookkeeping = Bookkeeping::for_rates(
                source_format.frames_per_second,
                self.shared.format.frames_per_second,
            );
            state.mixer = Some(mixer);
            tracing::debug!(source = source.name(), "mixer selected for link");
        }

        let Some(amplitude) =
            gain::combined_amplitude(&[source.gain(), &link.gain, &self.shared.gain])
        else {
            // A silent source contributes nothing, not even rounding noise.
            return Ok(false);
        };

        let (transform, generation) = source.position_transform();
        if !transform.is_invertible() {
            return Ok(false);
        }
        if state.generation != Some(generation) {
            state.frame_transform = transform;
            state.frac_transform = transform.to_fractional()?;
            state.generation = Some(generation);
            tracing::trace!(
                source = source.name(),
                generation,
                "link clock transform refreshed"
            );
        }

        // Frames the source has stably produced as of this instant.
        let stable_end = state.frame_transform.apply(now - FENCE_NANOS)?;
        if stable_end <= 0 {
            return Ok(false);
        }
        let readable_start = (stable_end - ring.frame_count() as i64).max(0);

        let mut src_pos = state.frac_transform.apply(t0)?;
        let mut bookkeeping = state.bookkeeping.clone();
        bookkeeping.src_pos_modulo = 0;
        bookkeeping.amplitude = amplitude;

        let dest_frames = frames as usize;
        let mut dest_offset = 0usize;

        // Positions that predate the ring's retention window stay silent.
        let readable_start_frac = readable_start << FRAC_BITS;
        if src_pos < readable_start_frac {
            let skip = bookkeeping
                .frames_until(src_pos, readable_start_frac)
                .min(dest_frames as u64);
            bookkeeping.advance(&mut src_pos, skip);
            dest_offset += skip as usize;
        }

        let mut contributed = false;
        while dest_offset < dest_frames {
            let frame = src_pos >> FRAC_BITS;
            if frame >= stable_end {
                // Not yet produced; the remainder of the job stays silent.
                break;
            }
            // One linear run: clipped at the ring boundary, the stable
            // horizon, and the 32-bit fractional position space.
            let slot = frame.rem_euclid(ring.frame_count() as i64) as usize;
            let run = (ring.frame_count() - slot)
                .min((stable_end - frame) as usize)
                .min(MAX_REGION_FRAMES);
            let run_start_frac = frame << FRAC_BITS;
            let mut frac_offset = (src_pos - run_start_frac) as i32;

            let mixer = state
                .mixer
                .as_mut()
                .ok_or_else(|| CaptureError::internal("link lost its mixer mid-pass"))?;
            let consumed = ring.with_frames(slot, run, |region| {
                mixer.mix(
                    scratch,
                    dest_frames,
                    &mut dest_offset,
                    region,
                    (run as u32) << FRAC_BITS,
                    &mut frac_offset,
                    accumulate,
                    &mut bookkeeping,
                )
            });
            src_pos = run_start_frac + i64::from(frac_offset);
            contributed = true;
            if !consumed {
                break;
            }
        }
        Ok(contributed)
    }

    fn fatal(&mut self, inner: &mut Inner, err: CaptureError) -> Step {
        tracing::error!(error = %err, "fatal error in mixing loop");
        self.shared
            .begin_shutdown(inner, &format!("mixing failure: {err}"));
        Step::Continue
    }

    /// Releases all resources exactly once, after the final loop iteration.
    ///
    /// Runs on the mixing context, so no in-flight mix can observe the
    /// payload after this point.
    fn release(&mut self) {
        let mut inner = self.shared.inner.lock();
        debug_assert!(inner.state.is_shut_down());
        if inner.payload.take().is_some() {
            tracing::debug!("payload mapping released");
        }
        inner.scratch = Vec::new();
        // Dropping the buffers returns their pool slots.
        inner.queues.pending.clear();
        inner.queues.finished.clear();
        inner.stop_callback = None;
        drop(inner);
        self.shared.links.lock().clear();
        self.shared.post(Delivery::Exit);
        tracing::info!("mixing domain deactivated");
    }
}
