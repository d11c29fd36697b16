//! `StubModel` — placeholder backend that echoes metadata without real inference.
//!
//! Stands in for whatever speech-recognition model a deployment plugs in
//! behind the `SpeechModel` trait. Produces a deterministic transcript so the
//! full Transcription Pool → Translator → Broadcast Hub pipeline can be
//! exercised end-to-end without a real model.

use crate::buffering::chunk::AudioChunk;
use crate::error::Result;
use crate::inference::{ModelOutput, SpeechModel};
use tracing::debug;

/// Echo-style stub model.
///
/// Chunks shorter than 160 samples (10 ms at 16 kHz) are treated as having no
/// recognizable speech and yield `None`.
pub struct StubModel {
    utterance_count: u32,
}

impl StubModel {
    pub fn new() -> Self {
        Self { utterance_count: 0 }
    }
}

impl Default for StubModel {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechModel for StubModel {
    fn warm_up(&mut self) -> Result<()> {
        debug!("StubModel::warm_up — no-op");
        Ok(())
    }

    fn transcribe(&mut self, chunk: &AudioChunk) -> Result<Option<ModelOutput>> {
        if chunk.samples.len() < 160 {
            return Ok(None);
        }

        self.utterance_count += 1;
        Ok(Some(ModelOutput {
            text: format!(
                "[stub utterance {}: {} samples @ {} Hz]",
                self.utterance_count,
                chunk.samples.len(),
                chunk.sample_rate
            ),
            language: "en".to_string(),
            confidence: Some(1.0),
        }))
    }

    fn reset(&mut self) {
        debug!("StubModel::reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_chunk_yields_no_transcript() {
        let mut model = StubModel::new();
        let chunk = AudioChunk::new(vec![0.0; 10], 16_000);
        assert!(model.transcribe(&chunk).unwrap().is_none());
    }

    #[test]
    fn long_chunk_yields_deterministic_transcript() {
        let mut model = StubModel::new();
        let chunk = AudioChunk::new(vec![0.0; 1600], 16_000);
        let out = model.transcribe(&chunk).unwrap().unwrap();
        assert!(out.text.contains("1600 samples"));
        assert_eq!(out.language, "en");
    }
}
