//! Segmenter — turns the continuous frame stream into discrete utterances.
//!
//! Restructures the accumulation logic the teacher fuses into its pipeline
//! loop (speech buffer, hangover/silence counting, min/max duration
//! handling) into its own component that emits `Segment` values on a
//! channel, rather than calling a speech model directly. The state machine
//! is `Listening → Recording → SilencePending → Listening`.
//!
//! The pure state machine (`Segmenter::process_window`) is deliberately
//! free of any I/O so it can be unit-tested window-by-window; `run` is the
//! thin thread loop that drains the ring buffer and drives it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    atomic::AtomicBool,
    Arc,
};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::buffering::chunk::AudioChunk;
use crate::buffering::{FrameConsumer, PopOutcome};
use crate::types::Segment;
use crate::vad::VoiceActivityDetector;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Sample rate of the frame stream (post-resample target rate, Hz).
    pub sample_rate: u32,
    /// VAD analysis window width (ms). Also the step at which the state
    /// machine advances.
    pub frame_ms: u64,
    /// Audio retained before the first speech frame of a segment.
    pub pre_speech_pad_ms: u64,
    /// Silence duration required, once speech has ended, before a Recording
    /// segment is closed.
    pub silence_threshold_ms: u64,
    /// Audio retained after the last speech frame of a segment (trailing
    /// pad appended to `pcm` before finalize truncates).
    pub post_speech_pad_ms: u64,
    /// Segments shorter than this (speech-only, excluding pads) are dropped.
    pub min_speech_duration_ms: u64,
    /// A Recording segment open this long is force-closed and a new one
    /// started immediately, bounding per-segment transcription latency.
    pub max_segment_duration_ms: u64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_ms: 20,
            pre_speech_pad_ms: 300,
            silence_threshold_ms: 1_500,
            post_speech_pad_ms: 500,
            min_speech_duration_ms: 250,
            max_segment_duration_ms: 30_000,
        }
    }
}

impl SegmenterConfig {
    fn window_samples(&self) -> usize {
        (self.sample_rate as u64 * self.frame_ms / 1000) as usize
    }
}

#[derive(Debug, Clone)]
pub enum SegmenterOutcome {
    Segment(Segment),
    /// A candidate utterance was closed but discarded for being shorter
    /// than `min_speech_duration_ms`.
    Rejected { duration_ms: u64 },
}

#[derive(Debug, Default)]
pub struct SegmenterStats {
    pub segments_emitted: AtomicU64,
    pub rejected_short: AtomicU64,
    /// Final ring-consumer counters, stamped once by `run` on exit — not
    /// updated incrementally since the consumer is owned by the run loop.
    pub frames_captured: AtomicU64,
    pub frames_overwritten: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Listening,
    Recording,
    SilencePending,
}

/// The Segmenter state machine. Holds no I/O handles — frames are handed in
/// one window at a time by the caller.
pub struct Segmenter {
    config: SegmenterConfig,
    vad: Box<dyn VoiceActivityDetector>,
    session_start: DateTime<Utc>,
    state: State,
    pcm: Vec<i16>,
    speech_samples: u64,
    silence_elapsed_ms: u64,
    start_sample_index: u64,
    next_id: u64,
    stats: Arc<SegmenterStats>,
}

impl Segmenter {
    pub fn new(
        config: SegmenterConfig,
        vad: Box<dyn VoiceActivityDetector>,
        session_start: DateTime<Utc>,
    ) -> Self {
        Self {
            config,
            vad,
            session_start,
            state: State::Listening,
            pcm: Vec::new(),
            speech_samples: 0,
            silence_elapsed_ms: 0,
            start_sample_index: 0,
            next_id: 1,
            stats: Arc::new(SegmenterStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SegmenterStats> {
        Arc::clone(&self.stats)
    }

    fn timestamp_for(&self, sample_index: u64) -> DateTime<Utc> {
        let ms = sample_index * 1000 / self.config.sample_rate as u64;
        self.session_start + chrono::Duration::milliseconds(ms as i64)
    }

    /// Feed one VAD-window's worth of i16 PCM through the state machine.
    ///
    /// `consumed_after_window` is the cumulative sample count (from the ring
    /// consumer) including this window — the basis for timestamp derivation.
    /// `pre_pad` is invoked only at a Listening→Recording transition, so
    /// callers can defer the (possibly non-trivial) lookback snapshot until
    /// it's actually needed.
    pub fn process_window(
        &mut self,
        window: &[i16],
        consumed_after_window: u64,
        pre_pad: impl FnOnce() -> Vec<i16>,
    ) -> Option<SegmenterOutcome> {
        let chunk = AudioChunk::new(
            window.iter().map(|s| *s as f32 / 32768.0).collect(),
            self.config.sample_rate,
        );
        let decision = self.vad.classify(&chunk);
        let window_ms = self.config.frame_ms;

        match self.state {
            State::Listening => {
                if decision.is_speech() {
                    let pad = pre_pad();
                    self.start_sample_index = consumed_after_window.saturating_sub(pad.len() as u64);
                    self.pcm = pad;
                    self.speech_samples = window.len() as u64;
                    self.silence_elapsed_ms = 0;
                    self.state = State::Recording;
                    debug!(segment_id = self.next_id, "speech onset, opening segment");
                }
                None
            }
            State::Recording => {
                self.pcm.extend_from_slice(window);
                if decision.is_speech() {
                    self.speech_samples += window.len() as u64;
                    self.silence_elapsed_ms = 0;
                } else {
                    self.state = State::SilencePending;
                    self.silence_elapsed_ms = window_ms;
                }
                self.maybe_force_close(consumed_after_window)
            }
            State::SilencePending => {
                self.pcm.extend_from_slice(window);
                if decision.is_speech() {
                    self.state = State::Recording;
                    self.speech_samples += window.len() as u64;
                    self.silence_elapsed_ms = 0;
                    None
                } else {
                    self.silence_elapsed_ms += window_ms;
                    if self.silence_elapsed_ms >= self.config.silence_threshold_ms {
                        Some(self.finalize(consumed_after_window))
                    } else {
                        None
                    }
                }
            }
        }
    }

    fn maybe_force_close(&mut self, consumed_after_window: u64) -> Option<SegmenterOutcome> {
        let duration_ms = self.pcm.len() as u64 * 1000 / self.config.sample_rate as u64;
        if duration_ms >= self.config.max_segment_duration_ms {
            Some(self.finalize(consumed_after_window))
        } else {
            None
        }
    }

    fn finalize(&mut self, consumed_after_window: u64) -> SegmenterOutcome {
        let sample_rate = self.config.sample_rate;

        // `pcm` has accumulated every window since onset, including however
        // much silence `silence_threshold_ms` required before closing — trim
        // the trailing silence back down to the configured retention pad.
        let post_pad_samples = self.config.post_speech_pad_ms * sample_rate as u64 / 1000;
        let silence_samples = self.silence_elapsed_ms * sample_rate as u64 / 1000;
        let trim = silence_samples.saturating_sub(post_pad_samples);
        if trim > 0 {
            let keep = self.pcm.len().saturating_sub(trim as usize);
            self.pcm.truncate(keep);
        }

        let speech_duration_ms = self.speech_samples * 1000 / sample_rate as u64;
        let start_ts = self.timestamp_for(self.start_sample_index);
        let end_ts = self.timestamp_for(consumed_after_window.saturating_sub(trim));
        let pcm = std::mem::take(&mut self.pcm);
        let id = self.next_id;
        self.next_id += 1;
        self.state = State::Listening;
        self.speech_samples = 0;
        self.silence_elapsed_ms = 0;
        self.vad.reset();

        if speech_duration_ms < self.config.min_speech_duration_ms {
            self.stats.rejected_short.fetch_add(1, Ordering::Relaxed);
            SegmenterOutcome::Rejected {
                duration_ms: speech_duration_ms,
            }
        } else {
            self.stats.segments_emitted.fetch_add(1, Ordering::Relaxed);
            SegmenterOutcome::Segment(Segment {
                id,
                start_ts,
                end_ts,
                pcm,
                sample_rate,
            })
        }
    }

    /// Called when the frame stream ends (Capture dropped). Closes any
    /// in-progress segment rather than discarding it silently.
    pub fn close_on_stream_end(&mut self, consumed_after_window: u64) -> Option<SegmenterOutcome> {
        if self.state == State::Listening {
            None
        } else {
            Some(self.finalize(consumed_after_window))
        }
    }
}

/// Drive a `Segmenter` from a live `FrameConsumer` until `running` clears,
/// sending each closed segment to `out`. Runs on its own thread — blocking
/// sleeps inside `FrameConsumer::pop_or_wait` are fine here, unlike Capture.
pub fn run(
    mut consumer: FrameConsumer,
    config: SegmenterConfig,
    vad: Box<dyn VoiceActivityDetector>,
    session_start: DateTime<Utc>,
    out: Sender<Segment>,
    running: Arc<AtomicBool>,
) -> Arc<SegmenterStats> {
    let window_samples = config.window_samples();
    let mut segmenter = Segmenter::new(config, vad, session_start);
    let stats = segmenter.stats();

    while running.load(Ordering::Relaxed) {
        match consumer.pop_or_wait(window_samples, Duration::from_millis(200)) {
            PopOutcome::Frames(window) => {
                let consumed = consumer.consumed_samples();
                let pad_samples = segmenter.config.pre_speech_pad_ms as u64
                    * segmenter.config.sample_rate as u64
                    / 1000;
                if let Some(outcome) = segmenter.process_window(&window, consumed, || {
                    consumer.snapshot_last(pad_samples as usize)
                }) {
                    emit(outcome, &out);
                }
            }
            PopOutcome::Timeout => {
                // No frames arrived; treat as silence so a pending segment
                // still closes even if Capture briefly stalls.
                let consumed = consumer.consumed_samples();
                let silence = vec![0i16; window_samples];
                if let Some(outcome) = segmenter.process_window(&silence, consumed, Vec::new) {
                    emit(outcome, &out);
                }
            }
        }
    }

    let consumed = consumer.consumed_samples();
    if let Some(outcome) = segmenter.close_on_stream_end(consumed) {
        emit(outcome, &out);
    }

    stats.frames_captured.store(consumer.consumed_samples(), Ordering::Relaxed);
    stats.frames_overwritten.store(consumer.overwritten(), Ordering::Relaxed);

    info!(
        emitted = stats.segments_emitted.load(Ordering::Relaxed),
        rejected_short = stats.rejected_short.load(Ordering::Relaxed),
        overwritten = consumer.overwritten(),
        "segmenter stopped"
    );

    stats
}

fn emit(outcome: SegmenterOutcome, out: &Sender<Segment>) {
    match outcome {
        SegmenterOutcome::Segment(segment) => {
            let _ = out.send(segment);
        }
        SegmenterOutcome::Rejected { duration_ms } => {
            debug!(duration_ms, "segment rejected: below min_speech_duration");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::energy::EnergyVad;

    fn cfg() -> SegmenterConfig {
        SegmenterConfig {
            sample_rate: 16_000,
            frame_ms: 20,
            pre_speech_pad_ms: 40,
            silence_threshold_ms: 60,
            post_speech_pad_ms: 60,
            min_speech_duration_ms: 30,
            max_segment_duration_ms: 30_000,
        }
    }

    fn silence(n: usize) -> Vec<i16> {
        vec![0; n]
    }

    fn speech(n: usize) -> Vec<i16> {
        vec![20_000; n]
    }

    #[test]
    fn speech_onset_then_silence_closes_segment() {
        let mut config = cfg();
        // A single 20ms speech window is fed below; cfg()'s 30ms
        // min_speech_duration_ms would reject that as too short, so this
        // test needs its own lower floor to exercise the Segment path.
        config.min_speech_duration_ms = 10;
        let mut seg = Segmenter::new(
            config,
            Box::new(EnergyVad::new(0.02, 0)),
            Utc::now(),
        );
        let window = 320usize; // 20ms @ 16kHz
        let mut consumed = 0u64;

        // Silence windows before speech.
        for _ in 0..2 {
            consumed += window as u64;
            let out = seg.process_window(&silence(window), consumed, || vec![]);
            assert!(out.is_none());
        }

        // Speech window opens a segment.
        consumed += window as u64;
        let out = seg.process_window(&speech(window), consumed, || silence(640));
        assert!(out.is_none());

        // Silence windows until silence_threshold_ms (60ms = 3 windows) elapses.
        let mut closed = None;
        for _ in 0..5 {
            consumed += window as u64;
            if let Some(outcome) = seg.process_window(&silence(window), consumed, || vec![]) {
                closed = Some(outcome);
                break;
            }
        }

        match closed.expect("segment should close") {
            SegmenterOutcome::Segment(segment) => {
                assert_eq!(segment.id, 1);
                assert!(segment.pcm.len() >= window);
            }
            SegmenterOutcome::Rejected { .. } => panic!("expected a segment, not a rejection"),
        }
    }

    #[test]
    fn trailing_pcm_is_trimmed_to_post_speech_pad_not_silence_threshold() {
        // silence_threshold_ms (120ms) governs when the segment closes;
        // post_speech_pad_ms (20ms) governs how much trailing silence the
        // finalized segment actually retains — the two must be independent.
        let mut config = cfg();
        config.silence_threshold_ms = 120;
        config.post_speech_pad_ms = 20;
        config.min_speech_duration_ms = 10;
        let mut seg = Segmenter::new(config, Box::new(EnergyVad::new(0.02, 0)), Utc::now());
        let window = 320usize; // 20ms @ 16kHz
        let mut consumed = 0u64;

        consumed += window as u64;
        seg.process_window(&speech(window), consumed, || vec![]);

        let mut closed = None;
        for _ in 0..10 {
            consumed += window as u64;
            if let Some(outcome) = seg.process_window(&silence(window), consumed, || vec![]) {
                closed = Some(outcome);
                break;
            }
        }

        match closed.expect("segment should close") {
            SegmenterOutcome::Segment(segment) => {
                // 1 speech window + 1 window (20ms) of retained trailing pad.
                assert_eq!(segment.pcm.len(), window * 2);
            }
            SegmenterOutcome::Rejected { .. } => panic!("expected a segment, not a rejection"),
        }
    }

    #[test]
    fn short_utterance_is_rejected() {
        let mut config = cfg();
        config.min_speech_duration_ms = 500;
        let mut seg = Segmenter::new(config, Box::new(EnergyVad::new(0.02, 0)), Utc::now());
        let window = 320usize;
        let mut consumed = 0u64;

        consumed += window as u64;
        seg.process_window(&speech(window), consumed, || vec![]);

        let mut outcome = None;
        for _ in 0..6 {
            consumed += window as u64;
            if let Some(o) = seg.process_window(&silence(window), consumed, || vec![]) {
                outcome = Some(o);
                break;
            }
        }

        match outcome.expect("segment should close") {
            SegmenterOutcome::Rejected { .. } => {}
            SegmenterOutcome::Segment(_) => panic!("expected rejection for short utterance"),
        }
    }

    #[test]
    fn close_on_stream_end_flushes_open_segment() {
        let mut config = cfg();
        config.min_speech_duration_ms = 10;
        let mut seg = Segmenter::new(config, Box::new(EnergyVad::new(0.02, 0)), Utc::now());
        let window = 320usize;
        seg.process_window(&speech(window), window as u64, || vec![]);
        let outcome = seg.close_on_stream_end(window as u64 * 2);
        assert!(matches!(outcome, Some(SegmenterOutcome::Segment(_))));
        // Listening again — a second stream-end call with nothing open is a no-op.
        assert!(seg.close_on_stream_end(window as u64 * 2).is_none());
    }
}
