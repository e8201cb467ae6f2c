//! # notewell-collab — Real-time collaboration layer for Notewell
//!
//! Client-side session management for multiplayer note editing: one manager
//! per open note owns a CRDT-backed shared document, an ephemeral awareness
//! channel, and a single authenticated WebSocket to the collaboration
//! relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   subscribe / commands   ┌─────────────────┐
//! │ Editor bindings  │ ◄──────────────────────► │ SessionManager  │
//! │ (UI layer)       │                          │  per document   │
//! └──────────────────┘                          └───────┬─────────┘
//!                                ┌──────────────────────┼───────────────┐
//!                                ▼                      ▼               ▼
//!                         ┌────────────┐        ┌───────────────┐  ┌──────────┐
//!                         │ SharedDoc  │        │ Awareness     │  │Transport │
//!                         │ (Yrs)      │        │ Channel       │  │(WebSocket│
//!                         └────────────┘        └───────────────┘  │ + token) │
//!                                                                  └────┬─────┘
//!                                                                       ▼
//!                                                                     relay
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded [`RelayMessage`])
//! - [`document`] — Yrs-backed shared document with delta bookkeeping
//! - [`presence`] — awareness channel: cursors, selections, online users
//! - [`auth`] — injectable token provider capability
//! - [`transport`] — authenticated WebSocket connection to the relay
//! - [`backoff`] — capped exponential reconnect policy
//! - [`session`] — the session manager tying it all together
//!
//! ## Guarantees
//!
//! - Local edits are never lost: applied to the shared document
//!   immediately, queued while offline, merged deterministically on
//!   reconnect (CRDT convergence).
//! - At most one live relay connection per session; a fresh auth token is
//!   fetched for every attempt.
//! - No state changes after `destroy()` — stale async completions are
//!   discarded via a generation counter.
//! - Failures surface only through the subscribed state snapshot, never as
//!   errors thrown at the UI.

pub mod auth;
pub mod backoff;
pub mod document;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use auth::{StaticToken, TokenProvider};
pub use backoff::Backoff;
pub use document::{DocError, SharedDoc};
pub use presence::{
    AwarenessChannel, AwarenessUpdate, Cursor, PeerColor, PeerInfo, PeerSummary, Selection,
};
pub use protocol::{HelloPayload, MessageKind, ProtocolError, RelayMessage};
pub use session::{
    OfflineQueue, SessionConfig, SessionManager, SessionParams, SessionSnapshot, SessionStatus,
    Subscription,
};
pub use transport::Transport;
