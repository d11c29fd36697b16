//! Shared data model: the values that move between pipeline stages.
//!
//! `Segment` is moved (never shared) across stage boundaries. `TranscriptionEvent`
//! is immutable once constructed and cheaply cloned for fan-out to the
//! broadcast hub's subscribers.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An utterance carved from the stream by the Segmenter.
///
/// `pcm` always begins with the configured pre-speech pad and ends with the
/// configured post-speech pad. Owned and moved, never shared, across stage
/// boundaries.
#[derive(Debug, Clone)]
pub struct Segment {
    pub id: u64,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub pcm: Vec<i16>,
    pub sample_rate: u32,
}

impl Segment {
    pub fn duration_sec(&self) -> f64 {
        (self.end_ts - self.start_ts).num_milliseconds() as f64 / 1000.0
    }
}

/// An attached translation, present on a `TranscriptionEvent` only on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Translation {
    pub text: String,
    pub language: String,
    pub backend: String,
}

/// A transcribed (and optionally translated) utterance, ready for fan-out.
///
/// Immutable once constructed — no `&mut` methods are exposed, only the
/// constructor, per the "dynamic typing of events" design note: this is a
/// tagged, schema'd value rather than a free-form dictionary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionEvent {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translation: Option<Translation>,
}

impl TranscriptionEvent {
    pub fn new(
        id: u64,
        timestamp: DateTime<Utc>,
        text: String,
        language: String,
        confidence: Option<f32>,
    ) -> Self {
        Self {
            id,
            timestamp,
            text,
            language,
            confidence,
            translation: None,
        }
    }

    /// Returns a copy of this event with a translation attached.
    pub fn with_translation(&self, translation: Translation) -> Self {
        let mut out = self.clone();
        out.translation = Some(translation);
        out
    }
}

/// Process-wide session metadata, constructed once by the Supervisor and
/// passed by `Arc` reference to every component. Per the "global mutable
/// state" design note: no process-wide singletons, a single explicit value.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub data_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcription_event_serializes_camel_case_and_omits_absent_fields() {
        let event = TranscriptionEvent::new(
            1,
            Utc::now(),
            "hello there".into(),
            "en".into(),
            Some(0.94),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["language"], "en");
        assert!(json.get("translation").is_none());

        let translated = event.with_translation(Translation {
            text: "ola".into(),
            language: "pt".into(),
            backend: "remote_rest_primary".into(),
        });
        let json = serde_json::to_value(&translated).unwrap();
        assert_eq!(json["translation"]["language"], "pt");
    }

    #[test]
    fn segment_duration_matches_timestamp_span() {
        let start = Utc::now();
        let end = start + chrono::Duration::milliseconds(2500);
        let seg = Segment {
            id: 1,
            start_ts: start,
            end_ts: end,
            pcm: vec![0; 100],
            sample_rate: 16_000,
        };
        assert!((seg.duration_sec() - 2.5).abs() < 1e-6);
    }
}
