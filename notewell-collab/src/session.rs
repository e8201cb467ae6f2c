//! Collaboration session manager.
//!
//! One [`SessionManager`] per open note: it owns the shared document, the
//! awareness channel, and at most one relay connection, and distills all of
//! it into a single subscribable [`SessionSnapshot`] for the UI.
//!
//! ```text
//!                 ┌────────────────────────────────────┐
//!   subscribe ───►│          SessionManager            │
//!   update_cursor │  status ∈ {connecting, synced,     │
//!   reconnect     │            error, disconnected}    │
//!   destroy       │                                    │
//!                 │  SharedDoc ── deltas ──┐           │
//!                 │  AwarenessChannel ─────┤           │
//!                 └────────────────────────┼───────────┘
//!                                          ▼
//!                                     Transport ◄──── fresh token per
//!                                          │          attempt (TokenProvider)
//!                                          ▼
//!                                        relay
//! ```
//!
//! Failure handling is entirely internal: auth and transport faults become
//! state transitions, never errors thrown at the caller. Every async
//! continuation is guarded by a generation counter so that a token fetch or
//! handshake resolving after `destroy()`/`reconnect()` cannot touch state
//! that has moved on.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use uuid::Uuid;

use crate::auth::TokenProvider;
use crate::backoff::Backoff;
use crate::document::SharedDoc;
use crate::presence::{AwarenessChannel, AwarenessUpdate, PeerSummary};
use crate::protocol::{HelloPayload, MessageKind, RelayMessage};
use crate::transport::Transport;

/// Connection lifecycle state, as shown to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Handshake in flight; local edits are accepted and queued
    Connecting,
    /// Relay acknowledged our state; updates flow both ways
    Synced,
    /// Auth or transport failure; eligible for reconnection
    Error,
    /// Preconditions unmet or session destroyed; terminal for this instance
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Synced => "synced",
            Self::Error => "error",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Everything a subscriber needs to render collaboration state.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub is_synced: bool,
    /// Remote peers, ordered by arrival, one entry per connection
    pub online_users: Vec<PeerSummary>,
    /// Local deltas the relay has not acknowledged yet
    pub pending_changes: usize,
}

/// Who is collaborating on what.
///
/// `document_id` and `user_id` are `None` when the host application has no
/// open note or no signed-in user; either (or `enabled = false`) keeps the
/// session in `Disconnected` without any network traffic.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub document_id: Option<String>,
    pub user_id: Option<String>,
    pub display_name: String,
    pub enabled: bool,
}

impl SessionParams {
    pub fn new(
        document_id: impl Into<String>,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            document_id: Some(document_id.into()),
            user_id: Some(user_id.into()),
            display_name: display_name.into(),
            enabled: true,
        }
    }

    fn ready(&self) -> bool {
        self.enabled
            && self.document_id.as_deref().is_some_and(|s| !s.is_empty())
            && self.user_id.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Tunables for connection and retry behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub relay_url: String,
    /// Bound on dial + handshake + first sync acknowledgment
    pub handshake_timeout: Duration,
    /// First automatic-retry delay; doubles per failure
    pub initial_backoff: Duration,
    /// Retry delay ceiling
    pub max_backoff: Duration,
    /// Treat auth failures like transport failures and retry them
    pub retry_on_auth_failure: bool,
    /// Deltas buffered while offline before falling back to resync
    pub offline_queue_limit: usize,
    /// Minimum gap between cursor broadcasts
    pub cursor_broadcast_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:9090".to_string(),
            handshake_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            retry_on_auth_failure: false,
            offline_queue_limit: 10_000,
            cursor_broadcast_interval: Duration::from_millis(33),
        }
    }
}

/// Deltas produced while no connection is up, replayed on (re)connect.
pub struct OfflineQueue {
    queue: VecDeque<(u64, Vec<u8>)>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max_size,
        }
    }

    /// Queue a delta for later replay. Returns `false` when full; a dropped
    /// delta is recovered by the sync-step exchange on reconnect.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back((clock, payload));
        true
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|(_, p)| p.len()).sum()
    }
}

type Listener = Arc<dyn Fn(&SessionSnapshot) + Send + Sync>;
type ListenerList = Mutex<Vec<(u64, Listener)>>;

/// Handle returned by [`SessionManager::subscribe`]. Dropping it does
/// nothing; call [`unsubscribe`](Subscription::unsubscribe) to detach.
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerList>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(list) = self.listeners.upgrade() {
            list.lock().unwrap().retain(|(id, _)| *id != self.id);
        }
    }
}

struct SessionState {
    status: SessionStatus,
    is_synced: bool,
}

struct ConnectionHandle {
    peer_id: Uuid,
    doc_id: String,
    /// Generation this connection belongs to; failure paths only tear down
    /// their own generation's connection
    gen: u64,
    transport: Transport,
}

impl ConnectionHandle {
    fn send(&self, msg: &RelayMessage) {
        self.transport.send(msg);
    }
}

/// Owns the full lifecycle of one collaborative editing session.
///
/// Construction never blocks: connection establishment runs on the tokio
/// runtime the manager was created on. All failure surfaces through the
/// subscribed snapshot, never through return values.
pub struct SessionManager {
    weak_self: Weak<SessionManager>,
    params: SessionParams,
    config: SessionConfig,
    provider: Arc<dyn TokenProvider>,

    doc: Arc<SharedDoc>,
    awareness: Mutex<Option<Arc<AwarenessChannel>>>,

    state: Mutex<SessionState>,
    listeners: Arc<ListenerList>,
    next_listener_id: AtomicU64,

    /// Bumped by `destroy()` and `reconnect()`; async continuations carry
    /// the generation they started under and bail out if it has moved
    generation: AtomicU64,
    destroyed: AtomicBool,

    conn: Mutex<Option<Arc<ConnectionHandle>>>,
    queue: Mutex<OfflineQueue>,
    unacked: Mutex<BTreeSet<u64>>,
    clock: AtomicU64,
    backoff: Mutex<Backoff>,
}

impl SessionManager {
    /// Create a session and, when the preconditions hold, begin connecting.
    ///
    /// With a missing document id, missing user id, or `enabled = false`,
    /// the session reports `Disconnected` and performs no I/O at all — the
    /// token provider is never invoked.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        params: SessionParams,
        provider: Arc<dyn TokenProvider>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let ready = params.ready();
        let backoff = Backoff::new(config.initial_backoff, config.max_backoff);
        let queue_limit = config.offline_queue_limit;
        let manager = Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            params,
            config,
            provider,
            doc: Arc::new(SharedDoc::new()),
            awareness: Mutex::new(None),
            state: Mutex::new(SessionState {
                status: if ready {
                    SessionStatus::Connecting
                } else {
                    SessionStatus::Disconnected
                },
                is_synced: false,
            }),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            conn: Mutex::new(None),
            queue: Mutex::new(OfflineQueue::new(queue_limit)),
            unacked: Mutex::new(BTreeSet::new()),
            clock: AtomicU64::new(0),
            backoff: Mutex::new(backoff),
        });

        if ready {
            manager.spawn_connect(0);
        } else {
            log::debug!("collaboration preconditions unmet, session stays disconnected");
        }
        manager
    }

    // ── Subscriber surface ───────────────────────────────────────────

    /// Current state, on demand.
    pub fn snapshot(&self) -> SessionSnapshot {
        let (status, is_synced) = {
            let st = self.state.lock().unwrap();
            (st.status, st.is_synced)
        };
        let online_users = self
            .awareness_handle()
            .map(|a| a.online_users())
            .unwrap_or_default();
        let pending_changes =
            self.queue.lock().unwrap().len() + self.unacked.lock().unwrap().len();
        SessionSnapshot {
            status,
            is_synced,
            online_users,
            pending_changes,
        }
    }

    /// Register a listener invoked synchronously on every state change.
    /// No ordering is guaranteed between multiple listeners.
    pub fn subscribe(
        &self,
        listener: impl Fn(&SessionSnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .unwrap()
            .push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// The live shared document, for editor bindings. Mutations made
    /// directly on it are shipped by the next [`commit`](Self::commit).
    pub fn document(&self) -> Arc<SharedDoc> {
        self.doc.clone()
    }

    /// The live awareness channel, or `None` before the first connection
    /// attempt has assigned a peer identity.
    pub fn awareness(&self) -> Option<Arc<AwarenessChannel>> {
        self.awareness_handle()
    }

    // ── Editing surface ──────────────────────────────────────────────

    /// Insert text and ship the resulting delta (or queue it while
    /// offline). Edits are applied locally no matter the connection state.
    pub fn insert_text(&self, index: u32, chunk: &str) {
        self.doc.insert(index, chunk);
        self.commit();
    }

    /// Delete a character range and ship the resulting delta.
    pub fn delete_text(&self, index: u32, len: u32) {
        self.doc.remove(index, len);
        self.commit();
    }

    /// Ship whatever has changed in the shared document since the last
    /// commit. Queued while no connection is up, counted as pending until
    /// the relay acknowledges.
    pub fn commit(&self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let Some(delta) = self.doc.take_local_delta() else {
            return;
        };
        let clock = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let conn = self.conn.lock().unwrap().clone();
        match conn {
            Some(conn) => {
                self.unacked.lock().unwrap().insert(clock);
                conn.send(&RelayMessage::delta(conn.peer_id, &conn.doc_id, clock, delta));
            }
            None => {
                if !self.queue.lock().unwrap().enqueue(clock, delta) {
                    log::warn!("offline queue full, dropping delta (resync recovers it)");
                }
            }
        }
        self.notify();
    }

    // ── Presence surface ─────────────────────────────────────────────

    /// Broadcast the local caret. Best-effort: throttled, silently dropped
    /// when unconnected, never an error.
    pub fn update_cursor(&self, anchor: u32, head: u32) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let Some(awareness) = self.awareness_handle() else {
            return;
        };
        if let Some(update) = awareness.set_local_cursor(anchor, head) {
            self.send_awareness(&update);
        }
    }

    /// Broadcast the local selection. Same best-effort contract as
    /// [`update_cursor`](Self::update_cursor).
    pub fn update_selection(&self, from: u32, to: u32) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let Some(awareness) = self.awareness_handle() else {
            return;
        };
        let update = awareness.set_local_selection(from, to);
        self.send_awareness(&update);
    }

    // ── Lifecycle surface ────────────────────────────────────────────

    /// Tear down the current connection and establish a new one with a
    /// freshly fetched token, reusing the same shared document. Bypasses
    /// and resets the automatic backoff. No-op after `destroy()` or on a
    /// precondition-gated session.
    pub fn reconnect(&self) {
        if self.destroyed.load(Ordering::SeqCst) || !self.params.ready() {
            return;
        }
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.teardown_connection(None);
        if let Some(awareness) = self.awareness_handle() {
            awareness.clear_remote();
        }
        self.backoff.lock().unwrap().reset();
        log::info!("manual reconnect requested");
        self.spawn_connect(gen);
    }

    /// Destroy the session: close the connection, release the document,
    /// emit a final `Disconnected` snapshot, detach all listeners.
    /// Idempotent and infallible from any state.
    pub fn destroy(&self) {
        {
            let mut st = self.state.lock().unwrap();
            if self.destroyed.swap(true, Ordering::SeqCst) {
                return;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            st.status = SessionStatus::Disconnected;
            st.is_synced = false;
        }
        self.teardown_connection(None);
        self.doc.release();
        if let Some(awareness) = self.awareness_handle() {
            awareness.clear_remote();
        }
        self.notify();
        self.listeners.lock().unwrap().clear();
        log::info!("session destroyed");
    }

    // ── Internals ────────────────────────────────────────────────────

    fn awareness_handle(&self) -> Option<Arc<AwarenessChannel>> {
        self.awareness.lock().unwrap().clone()
    }

    fn ensure_awareness(&self) -> Arc<AwarenessChannel> {
        let mut slot = self.awareness.lock().unwrap();
        slot.get_or_insert_with(|| {
            Arc::new(AwarenessChannel::with_cursor_interval(
                self.params.user_id.as_deref().unwrap_or_default(),
                &self.params.display_name,
                self.config.cursor_broadcast_interval,
            ))
        })
        .clone()
    }

    fn is_live(&self, gen: u64) -> bool {
        !self.destroyed.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == gen
    }

    /// Apply a state change, unless this continuation is stale. The check
    /// and the write happen under the state lock, so a concurrent
    /// `destroy()` either fully precedes or fully follows.
    fn transition(&self, gen: u64, status: SessionStatus, is_synced: bool) -> bool {
        {
            let mut st = self.state.lock().unwrap();
            if self.destroyed.load(Ordering::SeqCst)
                || self.generation.load(Ordering::SeqCst) != gen
            {
                return false;
            }
            if st.status == status && st.is_synced == is_synced {
                return true;
            }
            st.status = status;
            st.is_synced = is_synced;
        }
        self.notify();
        true
    }

    fn notify(&self) {
        let snapshot = self.snapshot();
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(&snapshot);
        }
    }

    fn send_awareness(&self, update: &AwarenessUpdate) {
        let conn = self.conn.lock().unwrap().clone();
        let Some(conn) = conn else {
            return;
        };
        if let Ok(msg) = RelayMessage::awareness(conn.peer_id, &conn.doc_id, update) {
            conn.send(&msg);
        }
    }

    /// Close and drop the live connection. With `only_gen` set, the
    /// connection is left alone unless it belongs to that generation.
    fn teardown_connection(&self, only_gen: Option<u64>) {
        let mut slot = self.conn.lock().unwrap();
        if let Some(conn) = slot.as_ref() {
            if only_gen.is_some_and(|gen| conn.gen != gen) {
                return;
            }
        }
        if let Some(conn) = slot.take() {
            conn.transport.close();
        }
    }

    fn spawn_connect(&self, gen: u64) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            this.run_connection(gen).await;
        });
    }

    fn schedule_retry(&self, gen: u64) {
        let delay = self.backoff.lock().unwrap().next_delay();
        log::info!("reconnecting in {delay:?}");
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.is_live(gen) {
                this.run_connection(gen).await;
            }
        });
    }

    fn fail_connection(&self, gen: u64, retry: bool) {
        self.teardown_connection(Some(gen));
        if self.transition(gen, SessionStatus::Error, false) && retry {
            self.schedule_retry(gen);
        }
    }

    /// One full connection attempt: token, handshake, announce, sync, then
    /// the frame loop until the stream ends or the generation moves on.
    async fn run_connection(self: Arc<Self>, gen: u64) {
        if !self.transition(gen, SessionStatus::Connecting, false) {
            return;
        }

        let token = self.provider.fetch_token().await;
        if !self.is_live(gen) {
            return;
        }
        let Some(token) = token else {
            log::warn!("token provider returned no credential");
            self.fail_connection(gen, self.config.retry_on_auth_failure);
            return;
        };

        let awareness = self.ensure_awareness();
        let peer = awareness.begin_connection();
        let doc_id = self.params.document_id.clone().unwrap_or_default();

        let hello = match RelayMessage::hello(&doc_id, &HelloPayload { token, peer: peer.clone() })
        {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("failed to encode handshake: {e}");
                self.fail_connection(gen, false);
                return;
            }
        };

        let (transport, mut frames) =
            match Transport::open(&self.config.relay_url, hello, self.config.handshake_timeout)
                .await
            {
                Ok(pair) => pair,
                Err(e) => {
                    log::info!("relay connection failed: {e}");
                    self.fail_connection(gen, true);
                    return;
                }
            };
        if !self.is_live(gen) {
            transport.close();
            return;
        }

        let conn = Arc::new(ConnectionHandle {
            peer_id: peer.peer_id,
            doc_id: doc_id.clone(),
            gen,
            transport,
        });
        {
            // Liveness is re-checked under the lock: destroy()/reconnect()
            // may have raced the handshake.
            let mut slot = self.conn.lock().unwrap();
            if !self.is_live(gen) {
                drop(slot);
                conn.transport.close();
                return;
            }
            if let Some(old) = slot.take() {
                old.transport.close();
            }
            *slot = Some(conn.clone());
        }
        log::info!("connected to relay for document {doc_id}");

        // Announce ourselves, request what we are missing, replay edits
        // made while offline.
        if let Ok(msg) = RelayMessage::peer_joined(&doc_id, &peer) {
            conn.send(&msg);
        }
        if let Ok(msg) = RelayMessage::awareness(peer.peer_id, &doc_id, &awareness.local_state()) {
            conn.send(&msg);
        }
        conn.send(&RelayMessage::sync_step1(
            peer.peer_id,
            &doc_id,
            self.doc.state_vector(),
        ));
        let replay = self.queue.lock().unwrap().drain();
        if !replay.is_empty() {
            log::info!("replaying {} offline deltas", replay.len());
        }
        for (clock, payload) in replay {
            self.unacked.lock().unwrap().insert(clock);
            conn.send(&RelayMessage::delta(peer.peer_id, &doc_id, clock, payload));
        }
        self.notify();

        let mut synced = false;
        let mut sweep = tokio::time::interval(Duration::from_secs(10));
        loop {
            let frame = if synced {
                tokio::select! {
                    frame = frames.recv() => frame,
                    _ = sweep.tick() => {
                        if !awareness.sweep_idle().is_empty() {
                            self.notify();
                        }
                        continue;
                    }
                }
            } else {
                // Still waiting for the relay's sync acknowledgment.
                match tokio::time::timeout(self.config.handshake_timeout, frames.recv()).await {
                    Ok(frame) => frame,
                    Err(_) => {
                        log::warn!("relay never acknowledged sync");
                        self.fail_connection(gen, true);
                        return;
                    }
                }
            };

            if !self.is_live(gen) {
                return;
            }
            match frame {
                Some(msg) => self.handle_frame(gen, msg, &conn, &awareness, &mut synced),
                None => {
                    log::info!("relay connection lost");
                    self.fail_connection(gen, true);
                    return;
                }
            }
        }
    }

    fn handle_frame(
        &self,
        gen: u64,
        msg: RelayMessage,
        conn: &ConnectionHandle,
        awareness: &AwarenessChannel,
        synced: &mut bool,
    ) {
        // The relay may echo our own frames back; presence already filters
        // them but document frames must not double-apply either.
        if msg.peer_id == conn.peer_id {
            return;
        }
        match msg.kind {
            MessageKind::Delta => {
                if let Err(e) = self.doc.apply_remote(&msg.payload) {
                    log::warn!("dropping malformed remote delta: {e}");
                }
            }
            MessageKind::DeltaAck => {
                let changed = {
                    let mut unacked = self.unacked.lock().unwrap();
                    let before = unacked.len();
                    let kept = unacked.split_off(&(msg.clock + 1));
                    *unacked = kept;
                    unacked.len() != before
                };
                if changed {
                    self.notify();
                }
            }
            MessageKind::SyncStep1 => match self.doc.diff_against(&msg.payload) {
                Ok(diff) => {
                    conn.send(&RelayMessage::sync_step2(conn.peer_id, &conn.doc_id, diff));
                }
                Err(e) => log::warn!("bad state vector from relay: {e}"),
            },
            MessageKind::SyncStep2 => {
                if let Err(e) = self.doc.apply_remote(&msg.payload) {
                    log::warn!("dropping malformed sync diff: {e}");
                }
                if !*synced {
                    *synced = true;
                    self.backoff.lock().unwrap().reset();
                    log::info!("document {} synced", conn.doc_id);
                    let _ = self.transition(gen, SessionStatus::Synced, true);
                }
            }
            MessageKind::Awareness => {
                if let Ok(update) = msg.awareness_update() {
                    awareness.apply_remote(msg.peer_id, &update);
                    self.notify();
                }
            }
            MessageKind::PeerJoined => {
                if let Ok(info) = msg.peer_info() {
                    awareness.peer_joined(&info);
                    self.notify();
                }
            }
            MessageKind::PeerLeft => {
                awareness.peer_left(msg.peer_id);
                self.notify();
            }
            MessageKind::Ping => {
                conn.send(&RelayMessage::pong(conn.peer_id, &conn.doc_id));
            }
            MessageKind::Hello | MessageKind::HelloAck | MessageKind::Pong => {}
        }
    }
}
