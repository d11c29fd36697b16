//! Lock-free SPSC ring buffer decoupling Capture from the Segmenter.
//!
//! Uses `ringbuf::HeapRb<i16>`, whose `push_slice`/`pop_slice` are wait-free
//! and allocation-free — safe to call from the real-time audio callback.
//!
//! A fully lock-free SPSC ring cannot evict already-buffered samples from the
//! producer side without consumer coordination (there is no way to "pop the
//! oldest" without racing the single consumer). When the ring is full,
//! `FrameProducer::push` therefore drops the newest incoming samples rather
//! than evicting resident ones; both are counted identically against
//! `overwritten`, since the invariant callers care about (no data loss goes
//! unrecorded) holds either way and blocking the real-time thread to implement
//! true head-eviction is not an option.

pub mod chunk;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

type RawProd = ringbuf::HeapProd<i16>;
type RawCons = ringbuf::HeapCons<i16>;

#[derive(Debug, Default)]
struct RingStats {
    overwritten: AtomicU64,
}

/// Producer half — held by the audio capture thread.
///
/// **Not** `Sync` with `FrameConsumer`'s lookback; each half is owned by
/// exactly one thread for the session lifetime.
pub struct FrameProducer {
    inner: RawProd,
    stats: Arc<RingStats>,
}

impl FrameProducer {
    /// Push samples into the ring (non-blocking, allocation-free).
    ///
    /// Returns the number of samples that could not be buffered this call.
    /// Every dropped sample increments the session-wide `overwritten` counter.
    pub fn push(&mut self, samples: &[i16]) -> usize {
        let written = self.inner.push_slice(samples);
        let lost = samples.len() - written;
        if lost > 0 {
            self.stats
                .overwritten
                .fetch_add(lost as u64, Ordering::Relaxed);
        }
        lost
    }
}

/// Outcome of a bounded consumer-side dequeue.
pub enum PopOutcome {
    /// At least one sample was available; may be shorter than requested.
    Frames(Vec<i16>),
    /// No samples arrived before the deadline.
    Timeout,
}

/// Consumer half — held by the Segmenter thread.
///
/// Retains a bounded lookback of everything it has drained from the ring so
/// `snapshot_last` can serve the Segmenter's pre-speech pad even though the
/// underlying samples have already left the lock-free ring.
pub struct FrameConsumer {
    inner: RawCons,
    stats: Arc<RingStats>,
    lookback: VecDeque<i16>,
    lookback_cap: usize,
    consumed_samples: u64,
}

impl FrameConsumer {
    /// Consumer-side dequeue: waits up to `timeout` for at least one sample,
    /// polling the lock-free ring (it has no native blocking wait). Returns
    /// `Timeout` instead of blocking indefinitely.
    pub fn pop_or_wait(&mut self, max_samples: usize, timeout: Duration) -> PopOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            let avail = self.inner.occupied_len();
            if avail > 0 {
                let take = avail.min(max_samples).max(1);
                let mut buf = vec![0i16; take];
                let n = self.inner.pop_slice(&mut buf);
                buf.truncate(n);
                self.consumed_samples += n as u64;
                self.extend_lookback(&buf);
                return PopOutcome::Frames(buf);
            }
            if Instant::now() >= deadline {
                return PopOutcome::Timeout;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn extend_lookback(&mut self, samples: &[i16]) {
        self.lookback.extend(samples.iter().copied());
        while self.lookback.len() > self.lookback_cap {
            self.lookback.pop_front();
        }
    }

    /// Copy the most recent `n` samples retained in the lookback window.
    ///
    /// Used for the Segmenter's pre-speech pad: audio already drained from
    /// the ring but still within `ring_capacity_sec` of history. If fewer
    /// than `n` samples have ever been seen, returns everything available.
    pub fn snapshot_last(&self, n_samples: usize) -> Vec<i16> {
        let len = self.lookback.len();
        let skip = len.saturating_sub(n_samples);
        self.lookback.iter().skip(skip).copied().collect()
    }

    /// Total samples drained from the ring since creation — the basis for
    /// frame-index-derived timestamps (`session_start + index × frame_duration`).
    pub fn consumed_samples(&self) -> u64 {
        self.consumed_samples
    }

    /// Number of samples dropped because the ring was full when `push` ran.
    pub fn overwritten(&self) -> u64 {
        self.stats.overwritten.load(Ordering::Relaxed)
    }
}

/// Create a matched producer/consumer pair.
///
/// `capacity_samples` should be `ring_capacity_sec * sample_rate`.
/// `lookback_samples` bounds the consumer's pre-speech-pad retention window
/// and is typically `pre_speech_pad_sec * sample_rate` or larger.
pub fn create_frame_ring(
    capacity_samples: usize,
    lookback_samples: usize,
) -> (FrameProducer, FrameConsumer) {
    let (prod, cons) = HeapRb::<i16>::new(capacity_samples.max(1)).split();
    let stats = Arc::new(RingStats::default());
    (
        FrameProducer {
            inner: prod,
            stats: Arc::clone(&stats),
        },
        FrameConsumer {
            inner: cons,
            stats,
            lookback: VecDeque::with_capacity(lookback_samples),
            lookback_cap: lookback_samples.max(1),
            consumed_samples: 0,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_roundtrips() {
        let (mut prod, mut cons) = create_frame_ring(1024, 256);
        let lost = prod.push(&[1, 2, 3, 4]);
        assert_eq!(lost, 0);
        match cons.pop_or_wait(16, Duration::from_millis(50)) {
            PopOutcome::Frames(v) => assert_eq!(v, vec![1, 2, 3, 4]),
            PopOutcome::Timeout => panic!("expected frames"),
        }
    }

    #[test]
    fn overflow_is_counted() {
        let (mut prod, _cons) = create_frame_ring(4, 16);
        let lost = prod.push(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(lost, 2);
        assert_eq!(_cons.overwritten(), 2);
    }

    #[test]
    fn pop_or_wait_times_out_on_empty_ring() {
        let (_prod, mut cons) = create_frame_ring(64, 16);
        match cons.pop_or_wait(8, Duration::from_millis(10)) {
            PopOutcome::Timeout => {}
            PopOutcome::Frames(_) => panic!("expected timeout"),
        }
    }

    #[test]
    fn snapshot_last_returns_bounded_lookback() {
        let (mut prod, mut cons) = create_frame_ring(1024, 4);
        prod.push(&[1, 2, 3, 4, 5, 6]);
        cons.pop_or_wait(6, Duration::from_millis(50));
        // lookback capacity is 4, so only the most recent 4 survive.
        assert_eq!(cons.snapshot_last(10), vec![3, 4, 5, 6]);
        assert_eq!(cons.consumed_samples(), 6);
    }
}
