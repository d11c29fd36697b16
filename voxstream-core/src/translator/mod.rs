//! Translator — attaches a `Translation` to each `TranscriptionEvent`.
//!
//! `TranslationBackend` is a capability trait, not a name string — "duck
//! typed" the way the teacher's `SpeechModel`/`VoiceActivityDetector` traits
//! are: any type that can translate text plugs in. Backends are tried in
//! configured fallback order; the first to succeed wins. Per-backend rate
//! limiting uses `governor`, drawn from the sibling signaling-server example
//! that already depends on it for token-bucket limiting.
//!
//! Backends run their HTTP calls on a caller-supplied `tokio::runtime::Handle`
//! via `block_on`, from a dedicated OS thread (never a tokio worker thread,
//! where `block_on` would panic) — the same "own thread, blocking is fine"
//! discipline the Segmenter and Transcription Pool use.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use governor::{Quota, RateLimiter};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Error;
use crate::pool::PoolOutcome;
use crate::types::{Translation, TranscriptionEvent};

pub type TranslateFuture = Pin<Box<dyn Future<Output = Result<String, Error>> + Send>>;

/// Capability trait for a translation backend. Implementations own their own
/// HTTP client / credentials and perform rate limiting internally.
pub trait TranslationBackend: Send + Sync + 'static {
    /// Stable identifier recorded on `Translation::backend` (e.g.
    /// `"remote_rest_primary"`).
    fn name(&self) -> &str;

    /// Translate `text` from `source_lang` to `target_lang`.
    fn translate(&self, text: String, source_lang: String, target_lang: String) -> TranslateFuture;
}

/// A `reqwest`-based backend against a generic JSON translation endpoint,
/// rate-limited with `governor`.
pub struct HttpBackend {
    name: String,
    endpoint: String,
    client: reqwest::Client,
    limiter: Arc<governor::DefaultDirectRateLimiter>,
}

impl HttpBackend {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, requests_per_sec: u32) -> Self {
        let quota = Quota::per_second(std::num::NonZeroU32::new(requests_per_sec.max(1)).unwrap());
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }
}

#[derive(serde::Serialize)]
struct TranslateRequest<'a> {
    text: &'a str,
    source: &'a str,
    target: &'a str,
}

#[derive(serde::Deserialize)]
struct TranslateResponse {
    translated_text: String,
}

impl TranslationBackend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn translate(&self, text: String, source_lang: String, target_lang: String) -> TranslateFuture {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let limiter = Arc::clone(&self.limiter);
        let backend_name = self.name.clone();
        Box::pin(async move {
            limiter.until_ready().await;
            let resp = client
                .post(&endpoint)
                .json(&TranslateRequest {
                    text: &text,
                    source: &source_lang,
                    target: &target_lang,
                })
                .send()
                .await
                .map_err(|e| Error::Translation {
                    backend: backend_name.clone(),
                    reason: e.to_string(),
                })?;
            let body: TranslateResponse = resp.json().await.map_err(|e| Error::Translation {
                backend: backend_name.clone(),
                reason: e.to_string(),
            })?;
            Ok(body.translated_text)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    pub target_lang: String,
    /// Number of events translated concurrently. Default 1 — events
    /// generally arrive slower than a translation round trip takes, so the
    /// simplest strictly-ordered path is usually also the fastest one.
    pub concurrency: usize,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            target_lang: "en".to_string(),
            concurrency: 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct TranslatorStats {
    pub translated: AtomicU64,
    pub failed_all_backends: AtomicU64,
}

/// Keyed by segment id like the Pool's own reorder buffer, and for the same
/// reason: the Pool's id sequence has gaps wherever a segment produced no
/// transcript, so a plain id-keyed map waiting on every integer would stall
/// forever the first time a segment is skipped upstream. Each
/// `PoolOutcome::Skipped` received here is inserted as `None` at its id,
/// letting the emitter step past the gap instead of blocking on an id that
/// will never arrive.
struct Reorder {
    next_id: u64,
    pending: BTreeMap<u64, Option<TranscriptionEvent>>,
}

type ReorderState = (Mutex<Reorder>, Condvar);

/// Owns the worker/emitter threads that attach translations to events.
pub struct Translator {
    workers: Vec<JoinHandle<()>>,
    emitter: Option<JoinHandle<()>>,
    stats: Arc<TranslatorStats>,
}

impl Translator {
    pub fn spawn(
        runtime: tokio::runtime::Handle,
        backends: Vec<Arc<dyn TranslationBackend>>,
        config: TranslatorConfig,
        events_in: Receiver<PoolOutcome>,
        events_out: Sender<TranscriptionEvent>,
    ) -> Self {
        let stats = Arc::new(TranslatorStats::default());
        // Segment/event ids start at 1 (Segmenter::new), so the reorder
        // buffer must wait on 1 first — starting at 0 would stall forever on
        // an id that never arrives.
        let reorder = Arc::new((
            Mutex::new(Reorder {
                next_id: 1,
                pending: BTreeMap::new(),
            }),
            Condvar::new(),
        ));

        let mut workers = Vec::with_capacity(config.concurrency.max(1));
        for worker_id in 0..config.concurrency.max(1) {
            let events_in = events_in.clone();
            let backends = backends.clone();
            let target_lang = config.target_lang.clone();
            let runtime = runtime.clone();
            let reorder = Arc::clone(&reorder);
            let stats = Arc::clone(&stats);
            workers.push(std::thread::spawn(move || {
                worker_loop(worker_id, events_in, backends, target_lang, runtime, reorder, stats);
            }));
        }

        let emitter = {
            let reorder = Arc::clone(&reorder);
            std::thread::spawn(move || emitter_loop(reorder, events_out))
        };

        Self {
            workers,
            emitter: Some(emitter),
            stats,
        }
    }

    pub fn stats(&self) -> Arc<TranslatorStats> {
        Arc::clone(&self.stats)
    }

    pub fn join(mut self) {
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
        if let Some(e) = self.emitter.take() {
            let _ = e.join();
        }
    }
}

fn worker_loop(
    worker_id: usize,
    events_in: Receiver<PoolOutcome>,
    backends: Vec<Arc<dyn TranslationBackend>>,
    target_lang: String,
    runtime: tokio::runtime::Handle,
    reorder: Arc<ReorderState>,
    stats: Arc<TranslatorStats>,
) {
    while let Ok(outcome) = events_in.recv() {
        let event = match outcome {
            PoolOutcome::Event(event) => event,
            PoolOutcome::Skipped(id) => {
                let (lock, cvar) = &*reorder;
                let mut guard = lock.lock();
                guard.pending.insert(id, None);
                cvar.notify_all();
                continue;
            }
        };

        let id = event.id;
        let mut translated = event.clone();

        let mut succeeded = false;
        for backend in &backends {
            let fut = backend.translate(event.text.clone(), event.language.clone(), target_lang.clone());
            match runtime.block_on(fut) {
                Ok(text) => {
                    translated = event.with_translation(Translation {
                        text,
                        language: target_lang.clone(),
                        backend: backend.name().to_string(),
                    });
                    succeeded = true;
                    stats.translated.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(err) => {
                    warn!(worker_id, event_id = id, backend = backend.name(), error = %err, "translation backend failed, trying next");
                }
            }
        }

        if !succeeded && !backends.is_empty() {
            stats.failed_all_backends.fetch_add(1, Ordering::Relaxed);
            debug!(event_id = id, "all translation backends failed; forwarding untranslated");
        }

        let (lock, cvar) = &*reorder;
        let mut guard = lock.lock();
        guard.pending.insert(id, Some(translated));
        cvar.notify_all();
    }
}

fn emitter_loop(reorder: Arc<ReorderState>, events_out: Sender<TranscriptionEvent>) {
    let (lock, cvar) = &*reorder;
    loop {
        let mut guard = lock.lock();
        loop {
            match guard.pending.remove(&guard.next_id) {
                Some(event) => {
                    guard.next_id += 1;
                    if let Some(event) = event {
                        if events_out.send(event).is_err() {
                            return;
                        }
                    }
                }
                None => break,
            }
        }
        cvar.wait(&mut guard);
    }
}
