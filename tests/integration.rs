//! End-to-end capture tests.
//!
//! All tests run against [`MockSource`] under paused tokio time, so
//! deadline-driven mixing is deterministic and no audio hardware is
//! required.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use capture_mix::{
    samples_from_bytes, CaptureError, CaptureEvent, CapturePacket, CaptureSource, CaptureState,
    Capturer, Format, MockSource, SampleFormat, SharedRegion,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(60);

struct Harness {
    capturer: Capturer,
    region: Arc<SharedRegion>,
    packets: mpsc::UnboundedReceiver<CapturePacket>,
    events: mpsc::UnboundedReceiver<CaptureEvent>,
}

/// Builds a capturer with an attached payload region and channel-backed
/// callbacks.
fn harness(format: Format, region_frames: usize) -> Harness {
    let (packet_tx, packets) = mpsc::unbounded_channel();
    let (event_tx, events) = mpsc::unbounded_channel();
    let capturer = Capturer::builder(format)
        .on_packet(move |packet| {
            let _ = packet_tx.send(packet);
        })
        .on_event(move |event| {
            let _ = event_tx.send(event);
        })
        .spawn();
    let region = SharedRegion::allocate(region_frames * format.bytes_per_frame());
    capturer.attach_payload(region.clone()).unwrap();
    Harness {
        capturer,
        region,
        packets,
        events,
    }
}

async fn next_packet(harness: &mut Harness) -> CapturePacket {
    timeout(RECV_TIMEOUT, harness.packets.recv())
        .await
        .expect("timed out waiting for packet")
        .expect("packet channel closed")
}

async fn next_event(harness: &mut Harness) -> CaptureEvent {
    timeout(RECV_TIMEOUT, harness.events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

fn f32_format(frames_per_second: u32) -> Format {
    Format::new(SampleFormat::F32, 1, frames_per_second).unwrap()
}

fn read_f32_frames(region: &SharedRegion, packet: &CapturePacket) -> Vec<f32> {
    let bytes = region
        .read_bytes(packet.offset_frames as usize * 4, packet.num_frames as usize * 4)
        .unwrap();
    samples_from_bytes(&bytes, SampleFormat::F32)
}

#[tokio::test(start_paused = true)]
async fn test_sync_capture_reproduces_source_bit_for_bit() {
    let format = f32_format(48000);
    let mut harness = harness(format, 9600);

    // Same-format source with a deterministic ramp, clock anchored at the
    // session epoch: unity gain and a point sampler make the capture a
    // bit-exact copy.
    let source = MockSource::new("mic", format, 9600);
    source.fill_ramp(0, 9600, 0.0, 0.0001);
    source.start_clock(0);
    harness.capturer.link_source(source).unwrap();

    harness.capturer.enqueue(0, 4800).unwrap();
    let packet = next_packet(&mut harness).await;

    assert_eq!(packet.offset_frames, 0);
    assert_eq!(packet.num_frames, 4800);
    assert_eq!(packet.sequence_number, 0);
    assert!(packet.discontinuous);
    assert!(packet.timestamp.is_some());

    let captured = read_f32_frames(&harness.region, &packet);
    for (i, value) in captured.iter().enumerate() {
        let expected = 0.0f32 + 0.0001 * i as f32;
        assert_eq!(
            value.to_bits(),
            expected.to_bits(),
            "frame {i} differs: {value} != {expected}"
        );
    }
    harness.capturer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_sync_buffers_finish_in_enqueue_order() {
    let format = f32_format(48000);
    let mut harness = harness(format, 4800);

    harness.capturer.enqueue(0, 1000).unwrap();
    harness.capturer.enqueue(1000, 1000).unwrap();
    harness.capturer.enqueue(2000, 1000).unwrap();

    let mut timestamps = Vec::new();
    for i in 0..3u64 {
        let packet = next_packet(&mut harness).await;
        assert_eq!(packet.sequence_number, i);
        assert_eq!(packet.offset_frames, i as u32 * 1000);
        assert_eq!(packet.num_frames, 1000);
        // Only the first packet after startup is discontinuous.
        assert_eq!(packet.discontinuous, i == 0);
        timestamps.push(packet.timestamp.unwrap());
    }
    assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
    harness.capturer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_async_capture_ping_pongs_through_buffer() {
    // 1kHz keeps mix jobs small (50-frame ceiling) and timing legible.
    let format = f32_format(1000);
    let mut harness = harness(format, 1000);

    harness.capturer.start_async(400).unwrap();

    // Slots at 0 and 400 fit; the slot at 800 would overhang the
    // 1000-frame buffer, so generation wraps back to offset 0.
    let expected_offsets = [0u32, 400, 0, 400];
    for (i, &expected) in expected_offsets.iter().enumerate() {
        let packet = next_packet(&mut harness).await;
        assert_eq!(packet.offset_frames, expected, "packet {i}");
        assert_eq!(packet.num_frames, 400);
        assert_eq!(packet.discontinuous, i == 0);
    }

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    harness
        .capturer
        .stop_async_with_callback(Box::new(move || {
            let _ = done_tx.send(());
        }))
        .unwrap();

    timeout(RECV_TIMEOUT, done_rx.recv())
        .await
        .expect("timed out waiting for stop callback")
        .unwrap();
    assert_eq!(harness.capturer.state(), CaptureState::OperatingSync);
    harness.capturer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_async_delivers_partial_buffer() {
    let format = f32_format(1000);
    let mut harness = harness(format, 1000);

    harness.capturer.start_async(400).unwrap();
    // Let a few 50-frame mix jobs land, then stop mid-packet.
    tokio::time::sleep(Duration::from_millis(200)).await;
    harness.capturer.stop_async().unwrap();

    let packet = next_packet(&mut harness).await;
    assert!(
        packet.num_frames > 0 && packet.num_frames < 400,
        "expected a partial packet, got {} frames",
        packet.num_frames
    );
    assert!(matches!(
        next_event(&mut harness).await,
        CaptureEvent::EndOfStream
    ));
    harness.capturer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_async_discards_empty_buffer() {
    let format = f32_format(1000);
    let mut harness = harness(format, 1000);

    harness.capturer.start_async(400).unwrap();
    // Stop before any mixing deadline can elapse: the generated buffer has
    // zero filled frames and must be discarded, not delivered.
    harness.capturer.stop_async().unwrap();

    assert!(matches!(
        next_event(&mut harness).await,
        CaptureEvent::EndOfStream
    ));
    assert!(harness.packets.try_recv().is_err());
    harness.capturer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_flush_delivers_unfilled_buffer_with_end_of_stream() {
    let format = f32_format(48000);
    let mut harness = harness(format, 4800);

    harness.capturer.enqueue(0, 4800).unwrap();
    // Flush before the mix deadline: the buffer comes back regardless of
    // fill level.
    harness.capturer.flush().unwrap();

    let packet = next_packet(&mut harness).await;
    assert_eq!(packet.num_frames, 0);
    assert_eq!(packet.timestamp, None);
    assert!(matches!(
        next_event(&mut harness).await,
        CaptureEvent::EndOfStream
    ));

    // A second flush with nothing queued delivers nothing.
    harness.capturer.flush().unwrap();
    assert!(harness.packets.try_recv().is_err());
    harness.capturer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_muted_capturer_produces_silence() {
    let format = f32_format(48000);
    let mut harness = harness(format, 4800);

    let source = MockSource::new("mic", format, 9600);
    source.fill_ramp(0, 9600, 0.5, 0.0);
    source.start_clock(0);
    harness.capturer.link_source(source).unwrap();

    harness.capturer.set_mute(true);
    harness.capturer.enqueue(0, 1000).unwrap();

    let packet = next_packet(&mut harness).await;
    assert_eq!(packet.num_frames, 1000);
    let captured = read_f32_frames(&harness.region, &packet);
    assert!(captured.iter().all(|&v| v == 0.0));
    harness.capturer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_source_contributes_nothing() {
    let format = f32_format(48000);
    let mut harness = harness(format, 4800);

    let audible = MockSource::new("mic", format, 9600);
    audible.fill_ramp(0, 9600, 0.0, 0.0001);
    audible.start_clock(0);
    harness.capturer.link_source(audible).unwrap();

    // Same data, but gained below the silence threshold: it must not
    // perturb the mix by even one bit.
    let silent = MockSource::new("loopback", format, 9600);
    silent.fill_ramp(0, 9600, 0.25, 0.0);
    silent.start_clock(0);
    silent.gain().set_db(-160.0);
    harness.capturer.link_source(silent).unwrap();

    harness.capturer.enqueue(0, 2400).unwrap();
    let packet = next_packet(&mut harness).await;

    let captured = read_f32_frames(&harness.region, &packet);
    for (i, value) in captured.iter().enumerate() {
        let expected = 0.0001 * i as f32;
        assert_eq!(value.to_bits(), expected.to_bits(), "frame {i}");
    }
    harness.capturer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_two_sources_sum() {
    let format = f32_format(48000);
    let mut harness = harness(format, 4800);

    for (name, value) in [("mic", 0.25f32), ("loopback", 0.5f32)] {
        let source = MockSource::new(name, format, 9600);
        source.fill_ramp(0, 9600, value, 0.0);
        source.start_clock(0);
        harness.capturer.link_source(source).unwrap();
    }

    harness.capturer.enqueue(0, 1200).unwrap();
    let packet = next_packet(&mut harness).await;

    let captured = read_f32_frames(&harness.region, &packet);
    assert!(captured.iter().all(|&v| (v - 0.75).abs() < 1e-6));
    harness.capturer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_resampling_source_mixes_at_destination_rate() {
    let dest = f32_format(48000);
    let mut harness = harness(dest, 4800);

    // 24kHz source into a 48kHz capture: the linear sampler interpolates.
    // A constant signal interpolates to itself, so every output frame that
    // falls inside the stable window must be the constant.
    let source_format = f32_format(24000);
    let source = MockSource::new("mic", source_format, 9600);
    source.fill_ramp(0, 9600, 0.5, 0.0);
    source.start_clock(0);
    harness.capturer.link_source(source).unwrap();

    harness.capturer.enqueue(0, 2400).unwrap();
    let packet = next_packet(&mut harness).await;

    let captured = read_f32_frames(&harness.region, &packet);
    assert!(captured.iter().all(|&v| (v - 0.5).abs() < 1e-4));
    harness.capturer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_format_less_link_is_skipped_until_configured() {
    let format = f32_format(48000);
    let mut harness = harness(format, 9600);

    let source = MockSource::unconfigured("virtual", 16000, 1);
    harness.capturer.link_source(source.clone()).unwrap();

    // No format yet: mixer selection is deferred and the link is skipped.
    harness.capturer.enqueue(0, 1000).unwrap();
    let packet = next_packet(&mut harness).await;
    let captured = read_f32_frames(&harness.region, &packet);
    assert!(captured.iter().all(|&v| v == 0.0));

    // Format appears: the same link starts contributing.
    source.set_format(format);
    source.fill_ramp(0, 16000, 0.3, 0.0);
    source.start_clock(0);

    harness.capturer.enqueue(1000, 1000).unwrap();
    let packet = next_packet(&mut harness).await;
    let captured = read_f32_frames(&harness.region, &packet);
    assert!(captured.iter().all(|&v| (v - 0.3).abs() < 1e-6));
    harness.capturer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_packet_source_is_excluded_from_mixing() {
    let format = f32_format(48000);
    let mut harness = harness(format, 4800);

    harness
        .capturer
        .link_source(MockSource::packet("renderer"))
        .unwrap();

    harness.capturer.enqueue(0, 1000).unwrap();
    let packet = next_packet(&mut harness).await;
    assert_eq!(packet.num_frames, 1000);
    let captured = read_f32_frames(&harness.region, &packet);
    assert!(captured.iter().all(|&v| v == 0.0));
    harness.capturer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_protocol_violation_shuts_session_down() {
    let format = f32_format(1000);
    let mut harness = harness(format, 1000);

    harness.capturer.start_async(250).unwrap();
    let err = harness.capturer.flush().unwrap_err();
    assert!(matches!(err, CaptureError::InvalidState { .. }));

    let mut saw_shutdown = false;
    while let Ok(event) = timeout(RECV_TIMEOUT, harness.events.recv()).await {
        match event {
            Some(CaptureEvent::ShutDown { reason }) => {
                assert!(reason.contains("flush"));
                saw_shutdown = true;
                break;
            }
            Some(_) => {}
            None => break,
        }
    }
    assert!(saw_shutdown);
    assert_eq!(harness.capturer.state(), CaptureState::ShutDown);

    // Further requests fail cleanly; the session stays dead.
    assert!(harness.capturer.enqueue(0, 100).is_err());
    assert_eq!(harness.capturer.state(), CaptureState::ShutDown);
    harness.capturer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_per_buffer_completion_callback() {
    let format = f32_format(48000);
    let mut harness = harness(format, 4800);

    let (tx, mut rx) = mpsc::unbounded_channel();
    harness
        .capturer
        .enqueue_with_callback(
            0,
            1000,
            Box::new(move |packet| {
                let _ = tx.send(packet);
            }),
        )
        .unwrap();

    let packet = timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for completion")
        .unwrap();
    assert_eq!(packet.num_frames, 1000);
    // The session-wide callback was bypassed for this buffer.
    assert!(harness.packets.try_recv().is_err());
    harness.capturer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stats_track_mixed_frames_and_packets() {
    let format = f32_format(48000);
    let mut harness = harness(format, 4800);

    harness.capturer.enqueue(0, 1000).unwrap();
    let _ = next_packet(&mut harness).await;

    let stats = harness.capturer.stats();
    assert_eq!(stats.packets_produced, 1);
    assert_eq!(stats.frames_mixed, 1000);
    harness.capturer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_continuity_broken_once_queue_runs_dry() {
    let format = f32_format(48000);
    let mut harness = harness(format, 4800);

    // Back-to-back buffers keep the timeline anchored: only the first is
    // discontinuous.
    harness.capturer.enqueue(0, 1000).unwrap();
    harness.capturer.enqueue(1000, 1000).unwrap();
    let first = next_packet(&mut harness).await;
    let second = next_packet(&mut harness).await;
    assert!(first.discontinuous);
    assert!(!second.discontinuous);

    // Once the queue runs dry the mapping is invalidated; the next capture
    // starts a new timeline and is flagged accordingly.
    harness.capturer.enqueue(0, 1000).unwrap();
    let third = next_packet(&mut harness).await;
    assert!(third.discontinuous);
    harness.capturer.shutdown().await;
}
