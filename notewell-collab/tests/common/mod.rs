//! In-process relay for integration tests.
//!
//! A reduced relay: rooms keyed by document id, token check at `Hello`,
//! sync-step answering against an authoritative Yrs doc, delta fan-out with
//! acknowledgments, awareness fan-out. Just enough server to exercise the
//! client session end-to-end.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, Transact};

use notewell_collab::protocol::{MessageKind, RelayMessage};

struct PeerHandle {
    user_id: String,
    tx: mpsc::Sender<Vec<u8>>,
    kick: mpsc::Sender<()>,
}

struct Room {
    doc: yrs::Doc,
    peers: HashMap<Uuid, (notewell_collab::presence::PeerInfo, PeerHandle)>,
}

impl Room {
    fn new() -> Self {
        Self {
            doc: yrs::Doc::new(),
            peers: HashMap::new(),
        }
    }

    fn fan_out(&self, from: Uuid, bytes: &[u8]) {
        for (peer_id, (_, handle)) in &self.peers {
            if *peer_id != from {
                let _ = handle.tx.try_send(bytes.to_vec());
            }
        }
    }
}

type Rooms = Arc<Mutex<HashMap<String, Room>>>;

pub struct TestRelay {
    url: String,
    rooms: Rooms,
    relay_id: Uuid,
}

impl TestRelay {
    /// Start a relay that accepts any token.
    pub async fn spawn() -> Self {
        Self::start(None).await
    }

    /// Start a relay that only accepts the listed tokens.
    pub async fn spawn_with_tokens(tokens: &[&str]) -> Self {
        Self::start(Some(tokens.iter().map(|t| t.to_string()).collect())).await
    }

    async fn start(accepted: Option<Vec<String>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let rooms: Rooms = Arc::new(Mutex::new(HashMap::new()));
        let relay_id = Uuid::new_v4();

        let accept_rooms = rooms.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let rooms = accept_rooms.clone();
                let accepted = accepted.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, rooms, accepted, relay_id).await;
                });
            }
        });

        Self {
            url: format!("ws://{addr}"),
            rooms,
            relay_id,
        }
    }

    pub fn url(&self) -> String {
        self.url.clone()
    }

    /// Force-close every connection belonging to `user_id`, simulating a
    /// transport drop mid-session.
    pub fn kick(&self, user_id: &str) {
        let rooms = self.rooms.lock().unwrap();
        for room in rooms.values() {
            for (_, (_, handle)) in &room.peers {
                if handle.user_id == user_id {
                    let _ = handle.kick.try_send(());
                }
            }
        }
    }

    /// Connected peer count for a document.
    pub fn peer_count(&self, doc_id: &str) -> usize {
        self.rooms
            .lock()
            .unwrap()
            .get(doc_id)
            .map(|r| r.peers.len())
            .unwrap_or(0)
    }
}

async fn handle_connection(
    stream: TcpStream,
    rooms: Rooms,
    accepted: Option<Vec<String>>,
    relay_id: Uuid,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    // First frame must be an acceptable Hello; otherwise drop the socket,
    // which the client reads as a rejection.
    let hello = loop {
        match ws_reader.next().await {
            Some(Ok(Message::Binary(data))) => {
                let bytes: Vec<u8> = data.into();
                break RelayMessage::decode(&bytes)?;
            }
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    };
    if hello.kind != MessageKind::Hello {
        return Ok(());
    }
    let payload = hello.hello_payload()?;
    if let Some(accepted) = &accepted {
        if !accepted.contains(&payload.token) {
            return Ok(());
        }
    }
    let peer = payload.peer.clone();
    let doc_id = hello.doc_id.clone();

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
    let (kick_tx, mut kick_rx) = mpsc::channel::<()>(1);

    let writer = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if ws_writer
                .send(Message::Binary(bytes.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Register, ack, introduce the roster, and ask for what we are missing.
    {
        let mut rooms = rooms.lock().unwrap();
        let room = rooms.entry(doc_id.clone()).or_insert_with(Room::new);

        let ack = RelayMessage::hello_ack(relay_id, &doc_id).encode().unwrap();
        let _ = out_tx.try_send(ack);

        for (info, _) in room.peers.values() {
            let joined = RelayMessage::peer_joined(&doc_id, info).unwrap();
            let _ = out_tx.try_send(joined.encode().unwrap());
        }

        let sv = {
            let txn = room.doc.transact();
            txn.state_vector().encode_v1()
        };
        let step1 = RelayMessage::sync_step1(relay_id, &doc_id, sv);
        let _ = out_tx.try_send(step1.encode().unwrap());

        let joined = RelayMessage::peer_joined(&doc_id, &peer).unwrap();
        let announce = joined.encode().unwrap();
        room.fan_out(peer.peer_id, &announce);

        room.peers.insert(
            peer.peer_id,
            (
                peer.clone(),
                PeerHandle {
                    user_id: peer.user_id.clone(),
                    tx: out_tx.clone(),
                    kick: kick_tx,
                },
            ),
        );
    }

    loop {
        let frame = tokio::select! {
            frame = ws_reader.next() => frame,
            _ = kick_rx.recv() => break,
        };
        let bytes: Vec<u8> = match frame {
            Some(Ok(Message::Binary(data))) => data.into(),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(_)) => break,
        };
        let Ok(msg) = RelayMessage::decode(&bytes) else {
            continue;
        };

        let mut rooms_guard = rooms.lock().unwrap();
        let Some(room) = rooms_guard.get_mut(&doc_id) else {
            break;
        };
        match msg.kind {
            MessageKind::Delta => {
                if let Ok(update) = yrs::Update::decode_v1(&msg.payload) {
                    let mut txn = room.doc.transact_mut();
                    let _ = txn.apply_update(update);
                }
                let ack = RelayMessage::delta_ack(relay_id, &doc_id, msg.clock);
                let _ = out_tx.try_send(ack.encode().unwrap());
                room.fan_out(peer.peer_id, &bytes);
            }
            MessageKind::SyncStep1 => {
                let diff = {
                    let txn = room.doc.transact();
                    match yrs::StateVector::decode_v1(&msg.payload) {
                        Ok(sv) => txn.encode_diff_v1(&sv),
                        Err(_) => continue,
                    }
                };
                let step2 = RelayMessage::sync_step2(relay_id, &doc_id, diff);
                let _ = out_tx.try_send(step2.encode().unwrap());
            }
            MessageKind::SyncStep2 => {
                if let Ok(update) = yrs::Update::decode_v1(&msg.payload) {
                    let mut txn = room.doc.transact_mut();
                    let _ = txn.apply_update(update);
                }
                // Forward the catch-up state to everyone else as a delta.
                let forward =
                    RelayMessage::delta(peer.peer_id, &doc_id, 0, msg.payload.clone());
                room.fan_out(peer.peer_id, &forward.encode().unwrap());
            }
            MessageKind::Awareness | MessageKind::PeerJoined | MessageKind::PeerLeft => {
                room.fan_out(peer.peer_id, &bytes);
            }
            MessageKind::Ping => {
                let pong = RelayMessage::pong(relay_id, &doc_id);
                let _ = out_tx.try_send(pong.encode().unwrap());
            }
            _ => {}
        }
    }

    // Departure: unregister and tell the others.
    {
        let mut rooms_guard = rooms.lock().unwrap();
        if let Some(room) = rooms_guard.get_mut(&doc_id) {
            room.peers.remove(&peer.peer_id);
            let left = RelayMessage::peer_left(peer.peer_id, &doc_id);
            room.fan_out(peer.peer_id, &left.encode().unwrap());
        }
    }
    writer.abort();
    Ok(())
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

use notewell_collab::auth::TokenProvider;
use notewell_collab::{SessionConfig, SessionParams};
use std::sync::atomic::AtomicUsize;

/// Token provider that counts its invocations, for spying on auth traffic.
pub fn counting_provider(token: &str) -> (Arc<dyn TokenProvider>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let token = token.to_string();
    let provider = move || {
        let counter = counter.clone();
        let token = token.clone();
        async move {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Some(token)
        }
    };
    (Arc::new(provider), calls)
}

/// Session config pointed at the test relay, with timeouts suited to tests.
/// The large initial backoff keeps automatic retries from racing tests that
/// drive reconnection manually.
pub fn test_config(url: &str) -> SessionConfig {
    SessionConfig {
        relay_url: url.to_string(),
        handshake_timeout: Duration::from_secs(3),
        initial_backoff: Duration::from_secs(60),
        max_backoff: Duration::from_secs(60),
        retry_on_auth_failure: false,
        offline_queue_limit: 10_000,
        cursor_broadcast_interval: Duration::from_millis(0),
    }
}

pub fn params(doc_id: &str, user_id: &str, name: &str) -> SessionParams {
    SessionParams::new(doc_id, user_id, name)
}
