//! Broadcast Hub — a loopback WebSocket server fanning `TranscriptionEvent`s
//! out to any number of subscribers.
//!
//! Grounded on `Pey-K-Cordia/signaling-server`'s `SignalingState` (a single
//! lock guarding a connection map, remove-on-disconnect, snapshot-then-send
//! to avoid holding the lock across socket writes) and on the
//! `voice_ws.rs` handler's split-socket pattern: `socket.split()` into
//! independent ingest/egress tasks joined with `tokio::select!`, whichever
//! side finishes first wins and the other is aborted.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use voxstream_core::TranscriptionEvent;

use crate::config::HubConfig;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ByeReason {
    Shutdown,
    IdleTimeout,
    SlowClient,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HubMessage {
    Hello {
        session_id: String,
        started_at: DateTime<Utc>,
        privacy_mode: &'static str,
    },
    History {
        events: Vec<TranscriptionEvent>,
    },
    Event {
        #[serde(flatten)]
        event: TranscriptionEvent,
    },
    Status {
        connected: bool,
        subscribers: usize,
    },
    Bye {
        reason: ByeReason,
    },
}

struct Subscriber {
    tx: mpsc::Sender<Message>,
    full_since: Mutex<Option<Instant>>,
}

struct SharedState {
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
    history: Mutex<VecDeque<TranscriptionEvent>>,
    session_id: String,
    started_at: DateTime<Utc>,
    config: HubConfig,
}

impl SharedState {
    fn send_to_all(&self, text: Message) {
        let senders: Vec<mpsc::Sender<Message>> = {
            let subs = self.subscribers.lock();
            subs.values().map(|s| s.tx.clone()).collect()
        };
        for tx in senders {
            let _ = tx.try_send(text.clone());
        }
    }

    fn mark_full(&self, id: Uuid) {
        let subs = self.subscribers.lock();
        if let Some(sub) = subs.get(&id) {
            let mut full_since = sub.full_since.lock();
            if full_since.is_none() {
                *full_since = Some(Instant::now());
            }
        }
    }

    fn clear_full(&self, id: Uuid) {
        let subs = self.subscribers.lock();
        if let Some(sub) = subs.get(&id) {
            *sub.full_since.lock() = None;
        }
    }
}

#[derive(Debug, Default)]
pub struct HubStats {
    pub total_connected: AtomicU64,
    pub slow_client_drops: AtomicU64,
}

/// Owns the subscriber map and history buffer; `serve` runs the accept loop
/// until its `CancellationToken` fires.
pub struct Hub {
    state: Arc<SharedState>,
    stats: Arc<HubStats>,
}

impl Hub {
    pub fn new(config: HubConfig, session_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(SharedState {
                subscribers: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::with_capacity(config.history_cap)),
                session_id,
                started_at,
                config,
            }),
            stats: Arc::new(HubStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<HubStats> {
        Arc::clone(&self.stats)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.subscribers.lock().len()
    }

    /// Push `event` into the history buffer and fan it out to every current
    /// subscriber. Never blocks: a full outbound queue is a drop, not a
    /// back-pressure signal to the caller (spec "the hub never
    /// back-pressures the Translator").
    pub fn broadcast(&self, event: TranscriptionEvent) {
        {
            let mut history = self.state.history.lock();
            history.push_back(event.clone());
            while history.len() > self.state.config.history_cap {
                history.pop_front();
            }
        }

        let msg = HubMessage::Event { event };
        let Ok(json) = serde_json::to_string(&msg) else {
            return;
        };
        let text = Message::Text(json);

        let snapshot: Vec<(Uuid, mpsc::Sender<Message>)> = {
            let subs = self.state.subscribers.lock();
            subs.iter().map(|(id, s)| (*id, s.tx.clone())).collect()
        };
        for (id, tx) in snapshot {
            match tx.try_send(text.clone()) {
                Ok(()) => self.state.clear_full(id),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.state.mark_full(id);
                    self.stats.slow_client_drops.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Bind and run the accept loop until `cancel` fires. Also runs a
    /// background sweep disconnecting subscribers whose outbound queue has
    /// stayed full for longer than `slow_client_grace_sec`.
    pub async fn serve(&self, cancel: CancellationToken) -> std::io::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.state.config.bind_address, self.state.config.port)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")))?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "broadcast hub listening");

        let app = Router::new()
            .route("/", get(ws_handler))
            .with_state((Arc::clone(&self.state), Arc::clone(&self.stats)));

        let sweep_state = Arc::clone(&self.state);
        let sweep_cancel = cancel.clone();
        let sweep = tokio::spawn(async move { sweep_slow_clients(sweep_state, sweep_cancel).await });

        let shutdown_cancel = cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown_cancel.cancelled().await })
            .await?;

        sweep.abort();
        Ok(())
    }

    /// Notify every subscriber of shutdown, give them `drain` to read it,
    /// then drop their queues — ending each connection's egress task and,
    /// transitively, its socket.
    pub async fn shutdown(&self, reason: ByeReason, drain: Duration) {
        let msg = HubMessage::Bye { reason };
        if let Ok(json) = serde_json::to_string(&msg) {
            self.state.send_to_all(Message::Text(json));
        }
        tokio::time::sleep(drain).await;
        self.state.subscribers.lock().clear();
    }
}

async fn sweep_slow_clients(state: Arc<SharedState>, cancel: CancellationToken) {
    let grace = Duration::from_secs(state.config.slow_client_grace_sec.max(1));
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let stale: Vec<Uuid> = {
            let subs = state.subscribers.lock();
            subs.iter()
                .filter_map(|(id, sub)| {
                    sub.full_since
                        .lock()
                        .filter(|since| since.elapsed() >= grace)
                        .map(|_| *id)
                })
                .collect()
        };
        if stale.is_empty() {
            continue;
        }
        let mut subs = state.subscribers.lock();
        for id in &stale {
            subs.remove(id);
        }
        drop(subs);
        for id in stale {
            warn!(%id, "disconnecting subscriber: queue full past grace period");
        }
    }
}

fn send_queued<T: Serialize>(tx: &mpsc::Sender<Message>, msg: &T) {
    if let Ok(json) = serde_json::to_string(msg) {
        let _ = tx.try_send(Message::Text(json));
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State((state, stats)): State<(Arc<SharedState>, Arc<HubStats>)>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, stats))
}

async fn handle_socket(socket: WebSocket, state: Arc<SharedState>, stats: Arc<HubStats>) {
    let id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<Message>(state.config.subscriber_queue.max(1));

    {
        let mut subs = state.subscribers.lock();
        if subs.len() >= state.config.max_subscribers {
            warn!(%id, "subscriber limit reached, rejecting connection");
            return;
        }
        subs.insert(
            id,
            Subscriber {
                tx: tx.clone(),
                full_since: Mutex::new(None),
            },
        );
    }
    stats.total_connected.fetch_add(1, Ordering::Relaxed);
    let count = state.subscribers.lock().len();
    info!(%id, subscribers = count, "subscriber connected");
    state.send_to_all(Message::Text(
        serde_json::to_string(&HubMessage::Status {
            connected: true,
            subscribers: count,
        })
        .unwrap_or_default(),
    ));

    send_queued(
        &tx,
        &HubMessage::Hello {
            session_id: state.session_id.clone(),
            started_at: state.started_at,
            privacy_mode: "local_only",
        },
    );
    let history: Vec<TranscriptionEvent> = state.history.lock().iter().cloned().collect();
    if !history.is_empty() {
        send_queued(&tx, &HubMessage::History { events: history });
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let mut egress = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut ingest = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut ingest => { egress.abort(); }
        _ = &mut egress => { ingest.abort(); }
    }

    state.subscribers.lock().remove(&id);
    let count = state.subscribers.lock().len();
    info!(%id, subscribers = count, "subscriber disconnected");
    state.send_to_all(Message::Text(
        serde_json::to_string(&HubMessage::Status {
            connected: false,
            subscribers: count,
        })
        .unwrap_or_default(),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bye_message_serializes_with_tag() {
        let msg = HubMessage::Bye {
            reason: ByeReason::SlowClient,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "bye");
        assert_eq!(json["reason"], "slow_client");
    }

    #[test]
    fn event_message_flattens_transcription_fields() {
        let event = TranscriptionEvent::new(3, Utc::now(), "hi".into(), "en".into(), None);
        let msg = HubMessage::Event { event };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["id"], 3);
        assert_eq!(json["text"], "hi");
    }

    #[test]
    fn broadcast_without_subscribers_is_a_noop() {
        let hub = Hub::new(HubConfig::default(), "session-1".into(), Utc::now());
        hub.broadcast(TranscriptionEvent::new(0, Utc::now(), "a".into(), "en".into(), None));
        assert_eq!(hub.subscriber_count(), 0);
    }
}
