//! Speech model abstraction.
//!
//! The `SpeechModel` trait decouples the pipeline from any specific backend.
//! The speech-recognition model itself is treated as an external collaborator
//! — this crate ships only the trait boundary and `StubModel`, a minimal
//! reference implementation that exercises the full pool/reorder/event
//! pipeline without running real inference.
//!
//! `&mut self` on `transcribe` intentionally expresses that decoders are
//! stateful — beam search caches, RNN hidden states, etc. All mutation is
//! therefore serialised through `ModelHandle`'s `parking_lot::Mutex`.

pub mod stub;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffering::chunk::AudioChunk;
use crate::error::Result;

/// One model invocation's result for a single `Segment`.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub text: String,
    pub language: String,
    pub confidence: Option<f32>,
}

/// Contract for speech recognition backends.
pub trait SpeechModel: Send + 'static {
    /// One-time warm-up: load weights, pre-allocate caches, run a dummy
    /// inference to populate CPU caches. Called once at engine startup.
    ///
    /// # Errors
    /// Returns an error if model files are missing or corrupt.
    fn warm_up(&mut self) -> Result<()>;

    /// Transcribe a single segment's worth of mono f32 audio.
    ///
    /// Each call corresponds to exactly one finished `Segment` — there is no
    /// partial/streaming result, matching the one-event-per-segment contract.
    ///
    /// # Returns
    /// `None` if no speech was recognized (e.g. the segment turned out to be
    /// noise the model rejects outright); implementations should prefer
    /// returning an empty-text `ModelOutput` over `None` when in doubt, since
    /// `None` suppresses the event entirely.
    fn transcribe(&mut self, chunk: &AudioChunk) -> Result<Option<ModelOutput>>;

    /// Reset all internal decoder state (e.g. between utterances).
    fn reset(&mut self);
}

/// Thread-safe reference-counted handle to any `SpeechModel` implementor.
///
/// Uses `parking_lot::Mutex` for:
/// - Non-poisoning on panic (unlike `std::sync::Mutex`)
/// - Faster uncontended lock than the std mutex
#[derive(Clone)]
pub struct ModelHandle(pub Arc<Mutex<dyn SpeechModel>>);

impl ModelHandle {
    /// Wrap any `SpeechModel` in a `ModelHandle`.
    pub fn new<M: SpeechModel>(model: M) -> Self {
        Self(Arc::new(Mutex::new(model)))
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").finish_non_exhaustive()
    }
}
