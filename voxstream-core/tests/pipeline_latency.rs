use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::bounded;
use voxstream_core::buffering::create_frame_ring;
use voxstream_core::inference::stub::StubModel;
use voxstream_core::pool::{PoolConfig, PoolOutcome, TranscriptionPool};
use voxstream_core::segmenter::{self, SegmenterConfig};
use voxstream_core::vad::EnergyVad;
use voxstream_core::ModelHandle;

#[test]
fn first_transcript_latency_under_500ms() {
    let sample_rate = 16_000u32;
    let (mut producer, consumer) = create_frame_ring(sample_rate as usize * 2, sample_rate as usize);

    // One 20ms window of "speech" plus enough trailing silence to close the
    // segment once pumped through the ring. The VAD here actually inspects
    // RMS (no hangover), so the all-zero windows are real `Silence`
    // decisions and the Segmenter takes its normal Recording →
    // SilencePending → finalize path rather than relying on the
    // max-duration force-close fallback.
    producer.push(&vec![20_000i16; 320]);
    for _ in 0..10 {
        producer.push(&vec![0i16; 320]);
    }

    let running = Arc::new(AtomicBool::new(true));
    let (raw_segments_tx, raw_segments_rx) = bounded(8);
    let (events_tx, events_rx) = bounded(8);

    let mut config = SegmenterConfig::default();
    config.sample_rate = sample_rate;
    config.frame_ms = 20;
    config.pre_speech_pad_ms = 40;
    config.silence_threshold_ms = 60;
    config.post_speech_pad_ms = 60;
    config.min_speech_duration_ms = 10;

    let segmenter_running = Arc::clone(&running);
    let segmenter_handle = thread::spawn(move || {
        segmenter::run(
            consumer,
            config,
            Box::new(EnergyVad::new(0.02, 0)),
            Utc::now(),
            raw_segments_tx,
            segmenter_running,
        )
    });

    let model = ModelHandle::new(StubModel::new());
    let pool = TranscriptionPool::spawn(model, PoolConfig::default(), raw_segments_rx, events_tx);

    let start = Instant::now();
    let first = loop {
        match events_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("expected a transcription event")
        {
            PoolOutcome::Event(event) => break event,
            PoolOutcome::Skipped(_) => continue,
        }
    };
    let elapsed = start.elapsed();

    running.store(false, Ordering::SeqCst);
    segmenter_handle.join().expect("segmenter thread panicked");
    pool.join();

    assert!(first.text.contains("stub utterance"));
    assert!(
        elapsed < Duration::from_millis(500),
        "first transcript took too long: {:?} (target < 500ms)",
        elapsed
    );
}
