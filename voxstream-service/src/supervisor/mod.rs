//! Supervisor — lifecycle owner for the whole pipeline.
//!
//! Generalizes `dictum-core`'s `DictumEngine` lifecycle shape
//! (`Idle → WarmingUp → Listening → Stopped/Error`, idempotent
//! `start()`/`stop()`, a single running flag) to own all eight components
//! instead of just a capture + pipeline pair, and replaces its ad hoc
//! `AtomicBool` with a single `tokio_util::sync::CancellationToken`
//! propagated to every stage. A background task still mirrors the token
//! into a plain `AtomicBool` for the thread-based components (Capture,
//! Segmenter) that predate `tokio` entirely and poll a flag rather than
//! await a future.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use voxstream_core::audio::AudioCapture;
use voxstream_core::buffering::create_frame_ring;
use voxstream_core::inference::stub::StubModel;
use voxstream_core::pool::{PoolOutcome, PoolStats, TranscriptionPool};
use voxstream_core::segmenter::{self, SegmenterStats};
use voxstream_core::translator::{HttpBackend, TranslationBackend, Translator, TranslatorStats};
use voxstream_core::{EnergyVad, Error, ModelHandle, Segment, SessionState, SpeechModel, TranscriptionEvent};

use crate::config::Config;
use crate::hub::{ByeReason, Hub};
use crate::persistence::Persistence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    Idle,
    WarmingUp,
    Listening,
    Stopped,
    Error,
}

struct RunningHandles {
    capture_thread: JoinHandle<()>,
    segmenter_thread: JoinHandle<Arc<SegmenterStats>>,
    tap_thread: JoinHandle<()>,
    pool: TranscriptionPool,
    translator: Option<Translator>,
    sink_thread: JoinHandle<()>,
    hub_task: tokio::task::JoinHandle<std::io::Result<()>>,
    running: Arc<AtomicBool>,
}

/// Top-level lifecycle owner: wires Capture → Ring → Segmenter →
/// Transcription Pool → Translator → (Hub + Persistence) and tears them
/// down in the reverse, draining order on shutdown.
pub struct Supervisor {
    config: Config,
    session: SessionState,
    status: Mutex<SupervisorStatus>,
    cancel: Mutex<CancellationToken>,
    hub: Arc<Hub>,
    persistence: Arc<Persistence>,
    pool_stats: Mutex<Option<Arc<PoolStats>>>,
    translator_stats: Mutex<Option<Arc<TranslatorStats>>>,
    handles: Mutex<Option<RunningHandles>>,
}

impl Supervisor {
    pub fn new(config: Config) -> std::io::Result<Self> {
        let session_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let data_dir = config
            .persistence
            .data_dir
            .join(format!("session_{}", started_at.format("%Y%m%d_%H%M%S")));

        let session = SessionState {
            session_id: session_id.clone(),
            started_at,
            data_dir: data_dir.clone(),
        };

        let hub = Arc::new(Hub::new(config.hub.clone(), session_id.clone(), started_at));
        let persistence = Arc::new(Persistence::new(
            crate::config::PersistenceConfig {
                data_dir,
                keep_segments: config.persistence.keep_segments,
            },
            session_id,
            config.capture.sample_rate,
        )?);

        Ok(Self {
            config,
            session,
            status: Mutex::new(SupervisorStatus::Idle),
            cancel: Mutex::new(CancellationToken::new()),
            hub,
            persistence,
            pool_stats: Mutex::new(None),
            translator_stats: Mutex::new(None),
            handles: Mutex::new(None),
        })
    }

    pub fn status(&self) -> SupervisorStatus {
        *self.status.lock()
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    /// Build the ring buffer and every stage, confirm the capture device
    /// opens, then flip to `Listening`. Idempotent: calling `start` while
    /// already running or warming up returns `Error::AlreadyRunning`.
    pub fn start(&self, runtime: tokio::runtime::Handle) -> Result<(), Error> {
        {
            let mut status = self.status.lock();
            if *status == SupervisorStatus::Listening || *status == SupervisorStatus::WarmingUp {
                return Err(Error::AlreadyRunning);
            }
            *status = SupervisorStatus::WarmingUp;
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();

        let running = Arc::new(AtomicBool::new(true));
        {
            let running = Arc::clone(&running);
            let cancel = cancel.clone();
            runtime.spawn(async move {
                cancel.cancelled().await;
                running.store(false, Ordering::SeqCst);
            });
        }

        let mut model = StubModel::default();
        if let Err(e) = model.warm_up() {
            *self.status.lock() = SupervisorStatus::Error;
            return Err(e);
        }
        let model = ModelHandle::new(model);

        let cap = self.config.capture.clone();
        let pad_samples = (self.config.segmenter.pre_speech_pad_ms * cap.sample_rate as u64 / 1000).max(1) as usize;
        let (producer, consumer) = create_frame_ring(cap.ring_capacity_samples(), pad_samples);

        let (raw_segments_tx, raw_segments_rx) = bounded::<Segment>(self.config.pool.workers.max(1) * 2);
        let (pool_segments_tx, pool_segments_rx) = bounded::<Segment>(self.config.pool.workers.max(1) * 2);
        let (events_tx, events_rx) = crossbeam_channel::unbounded::<PoolOutcome>();
        let (final_tx, final_rx) = crossbeam_channel::unbounded::<TranscriptionEvent>();

        let vad = Box::new(EnergyVad::new(self.config.vad.threshold, self.config.vad.hangover_frames));
        let segmenter_config = self.config.segmenter.clone();
        let segmenter_running = Arc::clone(&running);
        let session_start = self.session.started_at;
        let segmenter_thread = std::thread::spawn(move || {
            segmenter::run(consumer, segmenter_config, vad, session_start, raw_segments_tx, segmenter_running)
        });

        // Fan each segment out to the pool and to persistence's per-segment
        // WAV writer — the segmenter's channel has exactly one consumer, so
        // this thread is that consumer and relays onward.
        let persistence_tap = Arc::clone(&self.persistence);
        let tap_thread = std::thread::spawn(move || {
            for segment in raw_segments_rx.iter() {
                persistence_tap.write_segment(&segment);
                if pool_segments_tx.send(segment).is_err() {
                    break;
                }
            }
        });

        let pool = TranscriptionPool::spawn(model, self.config.pool.clone(), pool_segments_rx, events_tx);
        *self.pool_stats.lock() = Some(pool.stats());

        let translator = self.spawn_translator(runtime.clone(), events_rx, final_tx);

        let hub_sink = Arc::clone(&self.hub);
        let persistence_sink = Arc::clone(&self.persistence);
        let sink_thread = std::thread::spawn(move || {
            for event in final_rx.iter() {
                persistence_sink.write_event(&event);
                hub_sink.broadcast(event);
            }
        });

        let capture_running = Arc::clone(&running);
        let preferred = cap.preferred_input_device.clone();
        let target_rate = cap.sample_rate;
        let chunk_frames = cap.chunk_frames();
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<(), Error>>();
        let capture_thread = std::thread::spawn(move || match AudioCapture::open_with_preference(
            producer,
            Arc::clone(&capture_running),
            preferred.as_deref(),
            target_rate,
            chunk_frames,
        ) {
            Ok(capture) => {
                let _ = open_tx.send(Ok(()));
                while capture_running.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(100));
                }
                drop(capture);
            }
            Err(e) => {
                let _ = open_tx.send(Err(e));
            }
        });

        match open_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                running.store(false, Ordering::SeqCst);
                *self.status.lock() = SupervisorStatus::Error;
                return Err(e);
            }
            Err(_) => {
                running.store(false, Ordering::SeqCst);
                *self.status.lock() = SupervisorStatus::Error;
                warn!("capture thread ended before signaling device-open result");
                return Err(Error::Other(anyhow::anyhow!("capture thread died before signaling open")));
            }
        }

        let hub_for_serve = Arc::clone(&self.hub);
        let hub_cancel = cancel.clone();
        let hub_task = runtime.spawn(async move { hub_for_serve.serve(hub_cancel).await });

        *self.handles.lock() = Some(RunningHandles {
            capture_thread,
            segmenter_thread,
            tap_thread,
            pool,
            translator,
            sink_thread,
            hub_task,
            running,
        });
        *self.status.lock() = SupervisorStatus::Listening;
        info!(session_id = %self.session.session_id, "supervisor listening");
        Ok(())
    }

    fn spawn_translator(
        &self,
        runtime: tokio::runtime::Handle,
        events_rx: Receiver<PoolOutcome>,
        final_tx: crossbeam_channel::Sender<TranscriptionEvent>,
    ) -> Option<Translator> {
        if !self.config.translation.enabled || self.config.translation.backends.is_empty() {
            // Relay events untouched — a dedicated thread rather than a
            // bespoke "no-op translator" type, the same shape as every other
            // inter-stage relay in this pipeline. Skipped ids carry nothing
            // to forward; only real events reach the sink.
            std::thread::spawn(move || {
                for outcome in events_rx.iter() {
                    if let PoolOutcome::Event(event) = outcome {
                        if final_tx.send(event).is_err() {
                            break;
                        }
                    }
                }
            });
            return None;
        }

        let backends: Vec<Arc<dyn TranslationBackend>> = self
            .config
            .translation
            .backends
            .iter()
            .map(|b| {
                Arc::new(HttpBackend::new(b.name.clone(), b.endpoint.clone(), b.requests_per_sec.max(1)))
                    as Arc<dyn TranslationBackend>
            })
            .collect();

        let translator = Translator::spawn(runtime, backends, self.config.translation.translator.clone(), events_rx, final_tx);
        *self.translator_stats.lock() = Some(translator.stats());
        Some(translator)
    }

    /// Cancel Capture first, let the Segmenter flush any in-flight segment,
    /// let the Pool and Translator drain what's already enqueued, notify
    /// the Hub to `bye` every subscriber, then flush Persistence.
    pub async fn stop(&self) -> Result<(), Error> {
        {
            let mut status = self.status.lock();
            if *status != SupervisorStatus::Listening {
                return Err(Error::NotRunning);
            }
            *status = SupervisorStatus::Stopped;
        }

        self.cancel.lock().cancel();

        let handles = self.handles.lock().take();
        let Some(handles) = handles else {
            return Ok(());
        };

        let RunningHandles {
            capture_thread,
            segmenter_thread,
            tap_thread,
            pool,
            translator,
            sink_thread,
            hub_task,
            running,
        } = handles;

        running.store(false, Ordering::SeqCst);

        let _ = tokio::task::spawn_blocking(move || capture_thread.join()).await;
        let segmenter_stats = tokio::task::spawn_blocking(move || segmenter_thread.join().ok())
            .await
            .ok()
            .flatten();

        let _ = tokio::task::spawn_blocking(move || tap_thread.join()).await;
        let _ = tokio::task::spawn_blocking(move || pool.join()).await;
        if let Some(translator) = translator {
            let _ = tokio::task::spawn_blocking(move || translator.join()).await;
        }
        let _ = tokio::task::spawn_blocking(move || sink_thread.join()).await;

        self.hub
            .shutdown(ByeReason::Shutdown, Duration::from_secs(self.config.hub.shutdown_drain_sec.max(1)))
            .await;
        let _ = hub_task.await;

        let timestamp = self.session.started_at.format("%Y%m%d_%H%M%S").to_string();
        self.persistence.finalize(&timestamp);

        self.log_summary(segmenter_stats.as_deref());
        Ok(())
    }

    fn log_summary(&self, segmenter_stats: Option<&SegmenterStats>) {
        let pool_stats = self.pool_stats.lock().clone();
        let translator_stats = self.translator_stats.lock().clone();
        let hub_stats = self.hub.stats();
        let persistence_stats = self.persistence.stats();

        let frames_captured = segmenter_stats.map(|s| s.frames_captured.load(Ordering::Relaxed)).unwrap_or(0);
        let frames_overwritten = segmenter_stats.map(|s| s.frames_overwritten.load(Ordering::Relaxed)).unwrap_or(0);
        let segments_emitted = segmenter_stats.map(|s| s.segments_emitted.load(Ordering::Relaxed)).unwrap_or(0);
        let rejected_short = segmenter_stats.map(|s| s.rejected_short.load(Ordering::Relaxed)).unwrap_or(0);
        let rejected_hallucination = pool_stats
            .as_ref()
            .map(|s| s.skipped_hallucination.load(Ordering::Relaxed))
            .unwrap_or(0);
        let model_errors = pool_stats.as_ref().map(|s| s.skipped_error.load(Ordering::Relaxed)).unwrap_or(0);
        let translation_failures = translator_stats
            .as_ref()
            .map(|s| s.failed_all_backends.load(Ordering::Relaxed))
            .unwrap_or(0);
        let subscribers_connected = hub_stats.total_connected.load(Ordering::Relaxed);
        let slow_client_drops = hub_stats.slow_client_drops.load(Ordering::Relaxed);
        let persistence_errors = persistence_stats.errors.load(Ordering::Relaxed);

        println!(
            "session {} summary: captured_frames={frames_captured} overwritten_frames={frames_overwritten} \
segments_emitted={segments_emitted} rejected_short={rejected_short} rejected_hallucination={rejected_hallucination} \
model_errors={model_errors} translation_failures={translation_failures} subscribers_connected={subscribers_connected} \
slow_client_drops={slow_client_drops} persistence_errors={persistence_errors}",
            self.session.session_id,
        );
        if persistence_errors > 0 {
            error!(persistence_errors, "session ended with persistence errors");
        }
        info!("session stopped cleanly");
    }
}
