//! Persistence — writes segment WAVs and transcript/translation text files.
//!
//! WAV writes follow `keathmilligan-stt-app`'s `save_to_wav` (hound
//! create→write_sample-loop→finalize), adapted to 16-bit PCM `i16` samples
//! instead of f32, plus write-to-temp-then-rename so a crash mid-write never
//! leaves a half-written file at the final path. Text appends use a
//! write-then-flush discipline per file — a crash may truncate the last
//! line, which the contract accepts.
//!
//! Every failure here is logged and counted, never returned to the caller:
//! persistence must not back-pressure the live pipeline.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hound::{SampleFormat, WavSpec, WavWriter};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use voxstream_core::{Segment, TranscriptionEvent, Translation};

use crate::config::PersistenceConfig;

#[derive(Debug, Default)]
pub struct PersistenceStats {
    pub segments_written: AtomicU64,
    pub errors: AtomicU64,
}

pub struct Persistence {
    config: PersistenceConfig,
    session_id: String,
    sample_rate: u32,
    segment_ids: Mutex<BTreeSet<u64>>,
    transcript_file: Mutex<Option<File>>,
    translation_file: Mutex<Option<File>>,
    stats: Arc<PersistenceStats>,
}

impl Persistence {
    pub fn new(config: PersistenceConfig, session_id: String, sample_rate: u32) -> std::io::Result<Self> {
        fs::create_dir_all(config.data_dir.join("recordings"))?;
        fs::create_dir_all(config.data_dir.join("transcripts"))?;
        fs::create_dir_all(config.data_dir.join("translations"))?;
        Ok(Self {
            config,
            session_id,
            sample_rate,
            segment_ids: Mutex::new(BTreeSet::new()),
            transcript_file: Mutex::new(None),
            translation_file: Mutex::new(None),
            stats: Arc::new(PersistenceStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<PersistenceStats> {
        Arc::clone(&self.stats)
    }

    fn recordings_dir(&self) -> PathBuf {
        self.config.data_dir.join("recordings")
    }

    /// Write one segment's PCM to `recordings/segment_<id>.wav`.
    pub fn write_segment(&self, segment: &Segment) {
        let final_path = self.recordings_dir().join(format!("segment_{}.wav", segment.id));
        let tmp_path = self.recordings_dir().join(format!("segment_{}.wav.tmp", segment.id));
        match write_wav(&tmp_path, &segment.pcm, segment.sample_rate) {
            Ok(()) => match fs::rename(&tmp_path, &final_path) {
                Ok(()) => {
                    self.segment_ids.lock().insert(segment.id);
                    self.stats.segments_written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!(segment_id = segment.id, error = %e, "failed to rename segment WAV into place");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                }
            },
            Err(e) => {
                error!(segment_id = segment.id, error = %e, "failed to write segment WAV");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Append the transcript line for `event`, and the translation block if
    /// one is attached.
    pub fn write_event(&self, event: &TranscriptionEvent) {
        self.append_transcript(event);
        if let Some(translation) = &event.translation {
            self.append_translation(event, translation);
        }
    }

    fn append_transcript(&self, event: &TranscriptionEvent) {
        let path = self
            .config
            .data_dir
            .join("transcripts")
            .join(format!("transcript_{}.txt", self.session_id));
        let line = format!("[{}] {}\n", event.language, event.text);
        if let Err(e) = append_and_flush(&self.transcript_file, &path, &line) {
            error!(error = %e, "failed to append transcript line");
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn append_translation(&self, event: &TranscriptionEvent, translation: &Translation) {
        let path = self
            .config
            .data_dir
            .join("translations")
            .join(format!("translation_{}.txt", self.session_id));
        let block = format!(
            "[{}] {}\n[{}] {}\n\n",
            event.language, event.text, translation.language, translation.text
        );
        if let Err(e) = append_and_flush(&self.translation_file, &path, &block) {
            error!(error = %e, "failed to append translation block");
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Concatenate every surviving per-segment WAV (in id order) into
    /// `combined_recording_<session_timestamp>.wav`, then remove the
    /// per-segment files unless `keep_segments` is set.
    pub fn finalize(&self, session_timestamp: &str) {
        let ids: Vec<u64> = self.segment_ids.lock().iter().copied().collect();
        if ids.is_empty() {
            info!("no segments recorded, skipping combined recording");
            return;
        }

        let combined_path = self
            .config
            .data_dir
            .join(format!("combined_recording_{session_timestamp}.wav"));
        match self.concatenate(&ids, &combined_path) {
            Ok(()) => info!(path = %combined_path.display(), segments = ids.len(), "wrote combined recording"),
            Err(e) => {
                error!(error = %e, "failed to write combined recording");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        if !self.config.keep_segments {
            for id in ids {
                let path = self.recordings_dir().join(format!("segment_{id}.wav"));
                if let Err(e) = fs::remove_file(&path) {
                    warn!(segment_id = id, error = %e, "failed to remove per-segment WAV");
                }
            }
        }
    }

    fn concatenate(&self, ids: &[u64], out_path: &Path) -> std::io::Result<()> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let tmp_path = out_path.with_extension("wav.tmp");
        {
            let mut writer = WavWriter::create(&tmp_path, spec).map_err(hound_to_io)?;
            for id in ids {
                let path = self.recordings_dir().join(format!("segment_{id}.wav"));
                let mut reader = hound::WavReader::open(&path).map_err(hound_to_io)?;
                for sample in reader.samples::<i16>() {
                    writer.write_sample(sample.map_err(hound_to_io)?).map_err(hound_to_io)?;
                }
            }
            writer.finalize().map_err(hound_to_io)?;
        }
        fs::rename(&tmp_path, out_path)
    }
}

fn write_wav(path: &Path, pcm: &[i16], sample_rate: u32) -> std::io::Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).map_err(hound_to_io)?;
    for &sample in pcm {
        writer.write_sample(sample).map_err(hound_to_io)?;
    }
    writer.finalize().map_err(hound_to_io)
}

fn append_and_flush(handle: &Mutex<Option<File>>, path: &Path, text: &str) -> std::io::Result<()> {
    let mut guard = handle.lock();
    if guard.is_none() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        *guard = Some(OpenOptions::new().create(true).append(true).open(path)?);
    }
    let file = guard.as_mut().expect("just initialized above");
    file.write_all(text.as_bytes())?;
    file.flush()
}

fn hound_to_io(e: hound::Error) -> std::io::Error {
    std::io::Error::other(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn persistence(dir: &Path) -> Persistence {
        Persistence::new(
            PersistenceConfig {
                data_dir: dir.to_path_buf(),
                keep_segments: false,
            },
            "test-session".into(),
            16_000,
        )
        .unwrap()
    }

    fn segment(id: u64, pcm: Vec<i16>) -> Segment {
        Segment {
            id,
            start_ts: Utc::now(),
            end_ts: Utc::now(),
            pcm,
            sample_rate: 16_000,
        }
    }

    #[test]
    fn write_segment_then_finalize_produces_combined_wav() {
        let dir = tempdir().unwrap();
        let p = persistence(dir.path());
        p.write_segment(&segment(0, vec![1, 2, 3, 4]));
        p.write_segment(&segment(1, vec![5, 6]));
        assert_eq!(p.stats().segments_written.load(Ordering::Relaxed), 2);

        p.finalize("20260101_000000");
        let combined = dir.path().join("combined_recording_20260101_000000.wav");
        assert!(combined.exists());
        let mut reader = hound::WavReader::open(&combined).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, 2, 3, 4, 5, 6]);

        assert!(!dir.path().join("recordings/segment_0.wav").exists());
    }

    #[test]
    fn keep_segments_preserves_per_segment_files() {
        let dir = tempdir().unwrap();
        let p = Persistence::new(
            PersistenceConfig {
                data_dir: dir.path().to_path_buf(),
                keep_segments: true,
            },
            "s".into(),
            16_000,
        )
        .unwrap();
        p.write_segment(&segment(0, vec![7, 8]));
        p.finalize("ts");
        assert!(dir.path().join("recordings/segment_0.wav").exists());
    }

    #[test]
    fn write_event_appends_transcript_and_translation_lines() {
        let dir = tempdir().unwrap();
        let p = persistence(dir.path());
        let event = TranscriptionEvent::new(0, Utc::now(), "hello".into(), "en".into(), None)
            .with_translation(Translation {
                text: "ola".into(),
                language: "pt".into(),
                backend: "primary".into(),
            });
        p.write_event(&event);

        let transcript = fs::read_to_string(dir.path().join("transcripts/transcript_test-session.txt")).unwrap();
        assert_eq!(transcript, "[en] hello\n");

        let translation = fs::read_to_string(dir.path().join("translations/translation_test-session.txt")).unwrap();
        assert_eq!(translation, "[en] hello\n[pt] ola\n\n");
    }
}
