//! Presence and awareness for collaborative editing sessions.
//!
//! Tracks "who is in this document and where is their cursor": per-peer
//! records keyed by the ephemeral connection id, updated on every awareness
//! broadcast, removed on leave or idle timeout. Nothing here is persisted —
//! only the latest state per peer matters, and stale updates are discarded.
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! AwarenessChannel::set_local_cursor()   (rate-limited)
//!       │
//!       ▼
//! RelayMessage::Awareness ── relay fan-out ──► remote AwarenessChannel
//!                                                     │
//!                                                     ▼
//!                                             online_users() → UI
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Identity & color
// ───────────────────────────────────────────────────────────────────

/// Display color for a peer's cursor and selection highlight.
///
/// Derived deterministically from the *stable user id*, not the connection
/// id, so one user keeps one color across reconnects and across multiple
/// simultaneous tabs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl PeerColor {
    /// Derive a stable, visually distinct color from a user id.
    ///
    /// Hashes the id to a hue and converts HSL→RGB with fixed saturation
    /// and lightness, keeping cursors vivid without being garish.
    pub fn from_user_id(user_id: &str) -> Self {
        let hue = (fnv1a(user_id.as_bytes()) % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self {
            r: (r * 255.0) as u8,
            g: (g * 255.0) as u8,
            b: (b * 255.0) as u8,
        }
    }

    /// CSS hex form, e.g. `#5ac8a0`.
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// FNV-1a over the id bytes. Stable across platforms and runs, which the
/// color-stability guarantee depends on.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Peer identity announced at connection time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    /// Ephemeral connection id, minted per connection (one user with two
    /// tabs has two peer ids)
    pub peer_id: Uuid,
    /// Stable user id from the host application's auth layer
    pub user_id: String,
    pub name: String,
    pub color: PeerColor,
}

// ───────────────────────────────────────────────────────────────────
// Wire-embedded presence state
// ───────────────────────────────────────────────────────────────────

/// Caret position in the document, as character offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub anchor: u32,
    pub head: u32,
}

/// Selected character range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub from: u32,
    pub to: u32,
}

/// One peer's broadcast presence state.
///
/// Self-describing (carries user id and name) so a cursor arriving before
/// the peer's join notification can still be rendered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AwarenessUpdate {
    pub user_id: String,
    pub name: String,
    pub cursor: Option<Cursor>,
    pub selection: Option<Selection>,
    /// Per-sender monotonic counter; receivers drop anything older than the
    /// last applied value
    pub counter: u64,
}

/// Snapshot of one remote peer, as handed to the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSummary {
    /// Connection id (presence is per tab, not per user)
    pub id: Uuid,
    pub name: String,
    pub color: PeerColor,
    pub cursor: Option<Cursor>,
    pub selection: Option<Selection>,
}

/// Remote peer state tracked locally.
#[derive(Debug, Clone)]
struct PeerPresence {
    user_id: String,
    name: String,
    color: PeerColor,
    cursor: Option<Cursor>,
    selection: Option<Selection>,
    /// Highest counter applied; older broadcasts are stale
    last_counter: u64,
    /// Local arrival order, for a stable online-users listing
    join_seq: u64,
    last_seen: Instant,
}

// ───────────────────────────────────────────────────────────────────
// Awareness channel
// ───────────────────────────────────────────────────────────────────

/// Ephemeral broadcast channel state for one collaborative session.
///
/// Owns the local peer's presence and the view of all remote peers. The
/// session manager feeds remote frames in via [`apply_remote`]/
/// [`peer_joined`]/[`peer_left`] and ships the updates returned by the
/// `set_local_*` methods; the UI reads [`online_users`].
///
/// [`apply_remote`]: AwarenessChannel::apply_remote
/// [`peer_joined`]: AwarenessChannel::peer_joined
/// [`peer_left`]: AwarenessChannel::peer_left
/// [`online_users`]: AwarenessChannel::online_users
pub struct AwarenessChannel {
    user_id: String,
    name: String,
    color: PeerColor,
    local_peer: Mutex<Option<Uuid>>,
    peers: Mutex<HashMap<Uuid, PeerPresence>>,
    local_cursor: Mutex<Option<Cursor>>,
    local_selection: Mutex<Option<Selection>>,
    counter: AtomicU64,
    join_seq: AtomicU64,
    last_cursor_broadcast: Mutex<Instant>,
    cursor_interval: Duration,
    idle_timeout: Duration,
}

impl AwarenessChannel {
    /// Create a channel for the given local user. No peer id is assigned
    /// until a connection begins.
    pub fn new(user_id: &str, name: &str) -> Self {
        Self {
            user_id: user_id.to_owned(),
            name: name.to_owned(),
            color: PeerColor::from_user_id(user_id),
            local_peer: Mutex::new(None),
            peers: Mutex::new(HashMap::new()),
            local_cursor: Mutex::new(None),
            local_selection: Mutex::new(None),
            counter: AtomicU64::new(0),
            join_seq: AtomicU64::new(0),
            // allow an immediate first broadcast
            last_cursor_broadcast: Mutex::new(Instant::now() - Duration::from_secs(1)),
            cursor_interval: Duration::from_millis(33),
            idle_timeout: Duration::from_secs(30),
        }
    }

    /// Create with a custom cursor broadcast interval (for testing).
    pub fn with_cursor_interval(user_id: &str, name: &str, interval: Duration) -> Self {
        let mut channel = Self::new(user_id, name);
        channel.cursor_interval = interval;
        channel
    }

    /// The local user's stable display color.
    pub fn local_color(&self) -> PeerColor {
        self.color
    }

    /// The connection id currently representing the local peer, if any.
    pub fn local_peer_id(&self) -> Option<Uuid> {
        *self.local_peer.lock().unwrap()
    }

    /// Mint the peer identity for a new connection.
    ///
    /// Any presence entry left over from this channel's previous connection
    /// id is dropped; the relay announces the old id's departure to others.
    pub fn begin_connection(&self) -> PeerInfo {
        let peer_id = Uuid::new_v4();
        let mut local = self.local_peer.lock().unwrap();
        if let Some(old) = local.take() {
            self.peers.lock().unwrap().remove(&old);
        }
        *local = Some(peer_id);
        PeerInfo {
            peer_id,
            user_id: self.user_id.clone(),
            name: self.name.clone(),
            color: self.color,
        }
    }

    /// Update the local caret and return a broadcastable update, or `None`
    /// when throttled. Cursor traffic is high-frequency, so it is limited to
    /// one broadcast per interval; the latest position always wins anyway.
    pub fn set_local_cursor(&self, anchor: u32, head: u32) -> Option<AwarenessUpdate> {
        *self.local_cursor.lock().unwrap() = Some(Cursor { anchor, head });

        let mut last = self.last_cursor_broadcast.lock().unwrap();
        if last.elapsed() < self.cursor_interval {
            return None;
        }
        *last = Instant::now();
        drop(last);

        Some(self.local_state())
    }

    /// Update the local selection and return a broadcastable update.
    /// Selection changes are infrequent and always broadcast.
    pub fn set_local_selection(&self, from: u32, to: u32) -> AwarenessUpdate {
        *self.local_selection.lock().unwrap() = Some(Selection { from, to });
        self.local_state()
    }

    /// The local peer's current presence state with a fresh counter.
    pub fn local_state(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            user_id: self.user_id.clone(),
            name: self.name.clone(),
            cursor: *self.local_cursor.lock().unwrap(),
            selection: *self.local_selection.lock().unwrap(),
            counter: self.counter.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    /// Register a remote peer from a join notification.
    pub fn peer_joined(&self, info: &PeerInfo) {
        if Some(info.peer_id) == self.local_peer_id() {
            return;
        }
        let mut peers = self.peers.lock().unwrap();
        peers.entry(info.peer_id).or_insert_with(|| PeerPresence {
            user_id: info.user_id.clone(),
            name: info.name.clone(),
            color: info.color,
            cursor: None,
            selection: None,
            last_counter: 0,
            join_seq: self.join_seq.fetch_add(1, Ordering::Relaxed),
            last_seen: Instant::now(),
        });
    }

    /// Remove a remote peer.
    pub fn peer_left(&self, peer_id: Uuid) {
        self.peers.lock().unwrap().remove(&peer_id);
    }

    /// Apply a remote awareness broadcast.
    ///
    /// A broadcast from an unknown peer creates an entry on the spot — the
    /// cursor may race ahead of the join notification. Stale broadcasts
    /// (older counter) are silently dropped.
    pub fn apply_remote(&self, peer_id: Uuid, update: &AwarenessUpdate) {
        if Some(peer_id) == self.local_peer_id() {
            return;
        }
        let mut peers = self.peers.lock().unwrap();
        let entry = peers.entry(peer_id).or_insert_with(|| PeerPresence {
            user_id: update.user_id.clone(),
            name: update.name.clone(),
            color: PeerColor::from_user_id(&update.user_id),
            cursor: None,
            selection: None,
            last_counter: 0,
            join_seq: self.join_seq.fetch_add(1, Ordering::Relaxed),
            last_seen: Instant::now(),
        });
        if update.counter < entry.last_counter {
            return;
        }
        entry.cursor = update.cursor;
        entry.selection = update.selection;
        entry.last_counter = update.counter;
        entry.last_seen = Instant::now();
    }

    /// Remote peers currently online, ordered by arrival.
    ///
    /// Never includes the local peer's own connection id. Each connection is
    /// its own entry: one user with two tabs appears twice, with the same
    /// color.
    pub fn online_users(&self) -> Vec<PeerSummary> {
        let local = self.local_peer_id();
        let peers = self.peers.lock().unwrap();
        let mut entries: Vec<(&Uuid, &PeerPresence)> = peers
            .iter()
            .filter(|(id, _)| Some(**id) != local)
            .collect();
        entries.sort_by_key(|(_, p)| p.join_seq);
        entries
            .into_iter()
            .map(|(id, p)| PeerSummary {
                id: *id,
                name: p.name.clone(),
                color: p.color,
                cursor: p.cursor,
                selection: p.selection,
            })
            .collect()
    }

    /// Number of tracked remote peers.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Drop all remote peer state. The next connection rebuilds the roster
    /// from relay notifications.
    pub fn clear_remote(&self) {
        self.peers.lock().unwrap().clear();
    }

    /// Remove peers that have gone silent past the idle timeout.
    /// Returns the dropped connection ids.
    pub fn sweep_idle(&self) -> Vec<Uuid> {
        let timeout = self.idle_timeout;
        let mut peers = self.peers.lock().unwrap();
        let stale: Vec<Uuid> = peers
            .iter()
            .filter(|(_, p)| p.last_seen.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            peers.remove(id);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn update(user_id: &str, counter: u64, cursor: Option<Cursor>) -> AwarenessUpdate {
        AwarenessUpdate {
            user_id: user_id.to_owned(),
            name: user_id.to_uppercase(),
            cursor,
            selection: None,
            counter,
        }
    }

    // ── Color tests ──────────────────────────────────────────────

    #[test]
    fn test_color_stable_for_same_user() {
        assert_eq!(PeerColor::from_user_id("u1"), PeerColor::from_user_id("u1"));
    }

    #[test]
    fn test_color_differs_between_users() {
        // Not guaranteed in general, but these particular ids land on
        // different hues and act as a regression canary.
        assert_ne!(PeerColor::from_user_id("u1"), PeerColor::from_user_id("u2"));
    }

    #[test]
    fn test_color_hex_format() {
        let hex = PeerColor { r: 0x5a, g: 0xc8, b: 0xa0 }.to_hex();
        assert_eq!(hex, "#5ac8a0");
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    #[test]
    fn test_hsl_to_rgb_achromatic() {
        let (r, g, b) = hsl_to_rgb(0.3, 0.0, 0.5);
        assert!((r - 0.5).abs() < 0.01);
        assert!((g - 0.5).abs() < 0.01);
        assert!((b - 0.5).abs() < 0.01);
    }

    // ── Channel tests ────────────────────────────────────────────

    #[test]
    fn test_begin_connection_mints_fresh_peer_id() {
        let channel = AwarenessChannel::new("u1", "Alice");
        assert!(channel.local_peer_id().is_none());

        let first = channel.begin_connection();
        let second = channel.begin_connection();
        assert_ne!(first.peer_id, second.peer_id);
        assert_eq!(channel.local_peer_id(), Some(second.peer_id));
        assert_eq!(first.color, second.color);
    }

    #[test]
    fn test_peer_joined_and_left() {
        let channel = AwarenessChannel::new("u1", "Alice");
        channel.begin_connection();

        let bob = PeerInfo {
            peer_id: Uuid::new_v4(),
            user_id: "u2".into(),
            name: "Bob".into(),
            color: PeerColor::from_user_id("u2"),
        };
        channel.peer_joined(&bob);
        assert_eq!(channel.peer_count(), 1);

        channel.peer_left(bob.peer_id);
        assert_eq!(channel.peer_count(), 0);
    }

    #[test]
    fn test_online_users_excludes_local_peer() {
        let channel = AwarenessChannel::new("u1", "Alice");
        let me = channel.begin_connection();

        // A self-echo from the relay must not create a roster entry.
        channel.peer_joined(&me);
        channel.apply_remote(me.peer_id, &update("u1", 1, None));
        assert!(channel.online_users().is_empty());
    }

    #[test]
    fn test_online_users_ordered_by_arrival() {
        let channel = AwarenessChannel::new("u1", "Alice");
        channel.begin_connection();

        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for (i, id) in ids.iter().enumerate() {
            channel.peer_joined(&PeerInfo {
                peer_id: *id,
                user_id: format!("u{i}"),
                name: format!("Peer{i}"),
                color: PeerColor::from_user_id(&format!("u{i}")),
            });
        }

        let listed: Vec<Uuid> = channel.online_users().iter().map(|p| p.id).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn test_one_user_two_tabs_two_entries_same_color() {
        let channel = AwarenessChannel::new("viewer", "Viewer");
        channel.begin_connection();

        let tab1 = Uuid::new_v4();
        let tab2 = Uuid::new_v4();
        channel.apply_remote(tab1, &update("u1", 1, Some(Cursor { anchor: 1, head: 1 })));
        channel.apply_remote(tab2, &update("u1", 1, Some(Cursor { anchor: 9, head: 9 })));

        let users = channel.online_users();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].color, users[1].color);
    }

    #[test]
    fn test_stale_broadcast_dropped() {
        let channel = AwarenessChannel::new("u1", "Alice");
        channel.begin_connection();

        let peer = Uuid::new_v4();
        channel.apply_remote(peer, &update("u2", 5, Some(Cursor { anchor: 50, head: 50 })));
        channel.apply_remote(peer, &update("u2", 3, Some(Cursor { anchor: 0, head: 0 })));

        let users = channel.online_users();
        assert_eq!(users[0].cursor, Some(Cursor { anchor: 50, head: 50 }));
    }

    #[test]
    fn test_broadcast_from_unknown_peer_creates_entry() {
        let channel = AwarenessChannel::new("u1", "Alice");
        channel.begin_connection();

        let peer = Uuid::new_v4();
        channel.apply_remote(peer, &update("u2", 1, Some(Cursor { anchor: 7, head: 9 })));

        let users = channel.online_users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, peer);
        assert_eq!(users[0].color, PeerColor::from_user_id("u2"));
    }

    #[test]
    fn test_cursor_throttling() {
        let channel =
            AwarenessChannel::with_cursor_interval("u1", "Alice", Duration::from_millis(33));

        assert!(channel.set_local_cursor(1, 1).is_some());
        assert!(channel.set_local_cursor(2, 2).is_none());
    }

    #[test]
    fn test_cursor_broadcast_after_interval() {
        let channel =
            AwarenessChannel::with_cursor_interval("u1", "Alice", Duration::from_millis(5));

        let _ = channel.set_local_cursor(1, 1);
        thread::sleep(Duration::from_millis(10));
        assert!(channel.set_local_cursor(2, 2).is_some());
    }

    #[test]
    fn test_selection_always_broadcast() {
        let channel = AwarenessChannel::new("u1", "Alice");
        let a = channel.set_local_selection(0, 4);
        let b = channel.set_local_selection(2, 8);
        assert_eq!(a.selection, Some(Selection { from: 0, to: 4 }));
        assert_eq!(b.selection, Some(Selection { from: 2, to: 8 }));
        assert!(b.counter > a.counter);
    }

    #[test]
    fn test_local_state_counter_monotonic() {
        let channel = AwarenessChannel::new("u1", "Alice");
        let a = channel.local_state();
        let b = channel.local_state();
        assert!(b.counter > a.counter);
    }

    #[test]
    fn test_clear_remote() {
        let channel = AwarenessChannel::new("u1", "Alice");
        channel.begin_connection();
        channel.apply_remote(Uuid::new_v4(), &update("u2", 1, None));
        channel.apply_remote(Uuid::new_v4(), &update("u3", 1, None));
        assert_eq!(channel.peer_count(), 2);

        channel.clear_remote();
        assert_eq!(channel.peer_count(), 0);
    }
}
