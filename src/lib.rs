//! # capture-mix
//!
//! Real-time multi-source audio capture mixing.
//!
//! `capture-mix` takes one or more live source streams (clock-indexed ring
//! buffers fed by hardware or virtual devices), resamples and sums them
//! into a caller-supplied shared output buffer, and delivers completed
//! regions back to the client on precise timing boundaries.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use capture_mix::{Capturer, Format, MockSource, SampleFormat, SharedRegion};
//!
//! let format = Format::new(SampleFormat::I16, 1, 48000)?;
//! let capturer = Capturer::builder(format)
//!     .on_packet(|packet| println!("packet: {packet:?}"))
//!     .spawn();
//!
//! let source = MockSource::new("mic", format, 4800);
//! source.start_clock(0);
//! capturer.link_source(source)?;
//!
//! let region = SharedRegion::allocate(48000 * 2);
//! capturer.attach_payload(region.clone())?;
//! capturer.enqueue(0, 4800)?;            // sync capture, or:
//! // capturer.start_async(480)?;         // self-generated packets
//!
//! capturer.shutdown().await;
//! ```
//!
//! ## Architecture
//!
//! Two execution contexts cooperate:
//!
//! - **Control context**: client calls (attach, enqueue, flush, start/stop
//!   async, gain) plus a delivery task that invokes packet/event callbacks.
//! - **Mixing context**: one serialized task that runs the mixing loop,
//!   woken by an explicit signal or an armed deadline timer.
//!
//! All queue access is serialized by one short-held lock; no mixing or
//! delivery work happens under it. Completed work crosses contexts as a
//! fire-and-forget post, never a blocking call, so the real-time path
//! cannot deadlock against the client.
//!
//! Protocol violations (wrong-state calls, buffer re-attachment, flushing
//! during async capture) shut the session down rather than limping on; see
//! [`CaptureError`] for the policy.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats and
// fixed-point positions.
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod bridge;
mod builder;
mod capture;
mod capturer;
mod clock;
mod error;
mod event;
mod format;
mod gain;
pub mod mix;
mod packet;
mod payload;
pub mod source;
mod timeline;

pub use builder::CapturerBuilder;
pub use capture::CaptureState;
pub use capturer::{CaptureStats, Capturer};
pub use clock::{ManualClock, MonotonicClock, TokioClock};
pub use error::CaptureError;
pub use event::{
    event_callback, packet_callback, CaptureEvent, CompletionCallback, EventCallback,
    PacketCallback, StopCallback,
};
pub use format::{samples_from_bytes, Format, SampleFormat};
pub use gain::{db_to_amplitude, Gain, MAX_GAIN_DB, MUTED_GAIN_DB, UNITY_GAIN_DB};
pub use packet::CapturePacket;
pub use payload::SharedRegion;
pub use source::{CaptureSource, LinkId, MockSource, SourceRing, SourceType};
pub use timeline::{TimelineFunction, FRAC_BITS, FRAC_ONE};
