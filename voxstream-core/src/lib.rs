//! # voxstream-core
//!
//! Reusable streaming transcription/translation engine.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → Capture → SPSC FrameRing → Segmenter (VAD) → Segment
//!                                                               │
//!                                                   Transcription Pool (W workers)
//!                                                               │
//!                                                       TranscriptionEvent
//!                                                               │
//!                                                          Translator
//!                                                               │
//!                                              (handed to the service's Broadcast Hub)
//! ```
//!
//! The audio callback is zero-alloc. All heap work happens off the real-time thread.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod error;
pub mod inference;
pub mod pool;
pub mod segmenter;
pub mod translator;
pub mod types;
pub mod vad;

pub use error::{Error, Result};
pub use inference::{ModelHandle, ModelOutput, SpeechModel};
pub use pool::{PoolConfig, PoolOutcome, TranscriptionPool};
pub use segmenter::{Segmenter, SegmenterConfig};
pub use translator::{TranslationBackend, Translator, TranslatorConfig};
pub use types::{Segment, SessionState, Translation, TranscriptionEvent};
pub use vad::{EnergyVad, VadDecision, VoiceActivityDetector};
