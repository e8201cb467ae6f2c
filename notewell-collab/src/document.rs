//! Shared document: the replicated note body.
//!
//! Wraps a Yrs [`Doc`] with a single text root and the bookkeeping the
//! session manager needs: local mutations are applied immediately (merging
//! is the CRDT's job, not a lock's), and [`SharedDoc::take_local_delta`]
//! yields the bytes to ship — a v1 diff against the last state vector that
//! was handed out, so repeated takes only carry new changes.
//!
//! The CRDT merge algorithm itself is entirely Yrs's; nothing here inspects
//! update internals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

/// Name of the text root holding the note body.
const BODY_ROOT: &str = "body";

/// Document-level errors. Everything here is a malformed remote payload;
/// local operations cannot fail.
#[derive(Debug, Clone)]
pub enum DocError {
    BadUpdate(String),
    BadStateVector(String),
}

impl std::fmt::Display for DocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadUpdate(e) => write!(f, "malformed update: {e}"),
            Self::BadStateVector(e) => write!(f, "malformed state vector: {e}"),
        }
    }
}

impl std::error::Error for DocError {}

impl From<yrs::encoding::read::Error> for DocError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocError::BadUpdate(e.to_string())
    }
}

/// The shared, conflict-free note body.
///
/// One per session. Local edits and remote updates may land concurrently
/// from different tasks; Yrs transactions serialize them and the merge is
/// deterministic regardless of arrival order.
///
/// After [`release`](SharedDoc::release) (session destroyed) all mutation
/// becomes a silent no-op.
pub struct SharedDoc {
    doc: Doc,
    /// State vector as of the last delta handed to the session
    shipped: Mutex<StateVector>,
    /// Set by local mutation, cleared by `take_local_delta`
    dirty: AtomicBool,
    released: AtomicBool,
}

impl SharedDoc {
    pub fn new() -> Self {
        Self {
            doc: Doc::new(),
            shipped: Mutex::new(StateVector::default()),
            dirty: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    /// Insert `chunk` at character offset `index`, clamped to the current
    /// length. No-op after release.
    pub fn insert(&self, index: u32, chunk: &str) {
        if self.released.load(Ordering::Acquire) || chunk.is_empty() {
            return;
        }
        {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(BODY_ROOT);
            let len = text.len(&txn);
            text.insert(&mut txn, index.min(len), chunk);
        }
        self.dirty.store(true, Ordering::Release);
    }

    /// Append to the end of the body. No-op after release.
    pub fn push(&self, chunk: &str) {
        if self.released.load(Ordering::Acquire) || chunk.is_empty() {
            return;
        }
        {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(BODY_ROOT);
            text.push(&mut txn, chunk);
        }
        self.dirty.store(true, Ordering::Release);
    }

    /// Remove `len` characters starting at `index`, clamped to the current
    /// length. No-op after release.
    pub fn remove(&self, index: u32, len: u32) {
        if self.released.load(Ordering::Acquire) || len == 0 {
            return;
        }
        {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(BODY_ROOT);
            let total = text.len(&txn);
            if index >= total {
                return;
            }
            text.remove_range(&mut txn, index, len.min(total - index));
        }
        self.dirty.store(true, Ordering::Release);
    }

    /// Current body contents.
    pub fn contents(&self) -> String {
        let txn = self.doc.transact();
        match txn.get_text(BODY_ROOT) {
            Some(text) => text.get_string(&txn),
            None => String::new(),
        }
    }

    /// Body length in characters.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        txn.get_text(BODY_ROOT).map_or(0, |text| text.len(&txn))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encoded state vector of the full local state.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything the holder of `remote_sv` is missing, as a v1 update.
    pub fn diff_against(&self, remote_sv: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|e| DocError::BadStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Merge a remote update into the local state. No-op after release.
    pub fn apply_remote(&self, update: &[u8]) -> Result<(), DocError> {
        if self.released.load(Ordering::Acquire) {
            return Ok(());
        }
        let decoded = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| DocError::BadUpdate(e.to_string()))
    }

    /// Take the delta covering all local changes since the previous take.
    ///
    /// Returns `None` when nothing changed locally (or after release). The
    /// shipped state vector then advances to the current state, so a change
    /// is handed out exactly once; re-merging on the receiving side is
    /// idempotent either way.
    pub fn take_local_delta(&self) -> Option<Vec<u8>> {
        if self.released.load(Ordering::Acquire) {
            return None;
        }
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return None;
        }
        let mut shipped = self.shipped.lock().unwrap();
        let txn = self.doc.transact();
        let delta = txn.encode_diff_v1(&shipped);
        *shipped = txn.state_vector();
        Some(delta)
    }

    /// Stop accepting mutations. Called once on session destruction;
    /// idempotent.
    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Default for SharedDoc {
    fn default() -> Self {
        Self::new()
    }
}
