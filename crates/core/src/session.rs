//! Per-caller session context
//!
//! A `Session` carries the nested-call state of one caller across the hook
//! chain. The state the DXL layer itself needs is held in explicit typed
//! fields:
//!
//! - one lock handle stack per [`LockKind`]
//! - the transaction auto-close stack (one marker per successful transaction enter)
//! - a cooperative [`InterruptToken`]
//!
//! Other hooks can attach their own state through the typed registry:
//! [`Key<V>`] is a single slot (last write wins) and [`StackKey<V>`] is a LIFO
//! stack. Keys are identified by value type and name.
//!
//! Sessions are created and dropped by the caller; the DXL layer never closes
//! them. A session is used by one thread at a time.

use crate::types::SessionId;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// Lock handles
// ============================================================================

/// The two locks coordinated by the DXL layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockKind {
    /// Serializes schema changes against everything else
    Schema,
    /// Serializes row writes against scans (optional)
    Data,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Schema => write!(f, "schema"),
            LockKind::Data => write!(f, "data"),
        }
    }
}

/// Shared or exclusive access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Shared
    Read,
    /// Exclusive
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => write!(f, "read"),
            LockMode::Write => write!(f, "write"),
        }
    }
}

/// Whether a recorded handle has been granted yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireState {
    /// Pushed before blocking; not granted
    Pending,
    /// Granted and must be released
    Acquired,
}

/// A lock handle recorded on the session stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeldLock {
    /// Lock kind
    pub kind: LockKind,
    /// Requested mode
    pub mode: LockMode,
    /// Grant state
    pub state: AcquireState,
}

// ============================================================================
// Interruption
// ============================================================================

/// Cooperative interrupt flag
///
/// Clones share the flag, so another thread can interrupt a session blocked
/// in an interruptible lock acquisition.
#[derive(Debug, Clone, Default)]
pub struct InterruptToken(Arc<AtomicBool>);

impl InterruptToken {
    /// Create a clear token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request interruption
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Reset after the interruption was handled
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Check the flag
    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Typed registry keys
// ============================================================================

/// Single-slot registry key
pub struct Key<V> {
    name: &'static str,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Key<V> {
    /// Declare a key
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// Key name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// LIFO registry key
pub struct StackKey<V> {
    name: &'static str,
    _marker: PhantomData<fn() -> V>,
}

impl<V> StackKey<V> {
    /// Declare a key
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// Key name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

type SlotId = (TypeId, &'static str);

// ============================================================================
// Session
// ============================================================================

/// Caller context threaded through every DXL operation
pub struct Session {
    id: SessionId,
    schema_locks: SmallVec<[HeldLock; 4]>,
    data_locks: SmallVec<[HeldLock; 4]>,
    txn_auto_close: SmallVec<[bool; 4]>,
    interrupt: InterruptToken,
    slots: FxHashMap<SlotId, Box<dyn Any + Send>>,
    stacks: FxHashMap<SlotId, Box<dyn Any + Send>>,
}

impl Session {
    /// Create a session with a fresh id
    pub fn new() -> Self {
        Self::with_id(SessionId::next())
    }

    /// Create a session with a given id
    pub fn with_id(id: SessionId) -> Self {
        Self {
            id,
            schema_locks: SmallVec::new(),
            data_locks: SmallVec::new(),
            txn_auto_close: SmallVec::new(),
            interrupt: InterruptToken::new(),
            slots: FxHashMap::default(),
            stacks: FxHashMap::default(),
        }
    }

    /// Session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    // ---------------- lock handles ----------------

    fn locks(&self, kind: LockKind) -> &SmallVec<[HeldLock; 4]> {
        match kind {
            LockKind::Schema => &self.schema_locks,
            LockKind::Data => &self.data_locks,
        }
    }

    fn locks_mut(&mut self, kind: LockKind) -> &mut SmallVec<[HeldLock; 4]> {
        match kind {
            LockKind::Schema => &mut self.schema_locks,
            LockKind::Data => &mut self.data_locks,
        }
    }

    /// Record a pending handle before blocking on the lock
    pub fn push_lock(&mut self, kind: LockKind, mode: LockMode) {
        self.locks_mut(kind).push(HeldLock {
            kind,
            mode,
            state: AcquireState::Pending,
        });
    }

    /// Mark the most recent handle of `kind` as granted
    ///
    /// Returns false when no handle is recorded.
    pub fn mark_acquired(&mut self, kind: LockKind) -> bool {
        match self.locks_mut(kind).last_mut() {
            Some(top) => {
                top.state = AcquireState::Acquired;
                true
            }
            None => false,
        }
    }

    /// Pop the most recent handle of `kind`
    pub fn pop_lock(&mut self, kind: LockKind) -> Option<HeldLock> {
        self.locks_mut(kind).pop()
    }

    /// Most recent handle of `kind`
    pub fn top_lock(&self, kind: LockKind) -> Option<&HeldLock> {
        self.locks(kind).last()
    }

    /// Number of recorded handles of `kind`
    pub fn lock_depth(&self, kind: LockKind) -> usize {
        self.locks(kind).len()
    }

    /// Recorded handles of `kind`, oldest first
    pub fn held_locks(&self, kind: LockKind) -> &[HeldLock] {
        self.locks(kind)
    }

    // ---------------- transaction markers ----------------

    /// Record whether the current enter began the transaction
    pub fn push_txn_marker(&mut self, began: bool) {
        self.txn_auto_close.push(began);
    }

    /// Current marker without removing it
    pub fn peek_txn_marker(&self) -> Option<bool> {
        self.txn_auto_close.last().copied()
    }

    /// Remove the current marker
    pub fn pop_txn_marker(&mut self) -> Option<bool> {
        self.txn_auto_close.pop()
    }

    /// Number of recorded markers
    pub fn txn_marker_depth(&self) -> usize {
        self.txn_auto_close.len()
    }

    // ---------------- interruption ----------------

    /// Handle to interrupt this session from another thread
    pub fn interrupt_token(&self) -> InterruptToken {
        self.interrupt.clone()
    }

    /// Check for a pending interrupt
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_interrupted()
    }

    // ---------------- typed registry ----------------

    /// Read a single-slot value
    pub fn get<V: Any + Send>(&self, key: &Key<V>) -> Option<&V> {
        self.slots
            .get(&(TypeId::of::<V>(), key.name))
            .and_then(|b| b.downcast_ref::<V>())
    }

    /// Store a single-slot value, returning the previous one
    pub fn put<V: Any + Send>(&mut self, key: &Key<V>, value: V) -> Option<V> {
        self.slots
            .insert((TypeId::of::<V>(), key.name), Box::new(value))
            .and_then(|b| b.downcast::<V>().ok())
            .map(|b| *b)
    }

    /// Remove a single-slot value
    pub fn remove<V: Any + Send>(&mut self, key: &Key<V>) -> Option<V> {
        self.slots
            .remove(&(TypeId::of::<V>(), key.name))
            .and_then(|b| b.downcast::<V>().ok())
            .map(|b| *b)
    }

    fn stack_mut<V: Any + Send>(&mut self, key: &StackKey<V>) -> Option<&mut Vec<V>> {
        self.stacks
            .get_mut(&(TypeId::of::<V>(), key.name))
            .and_then(|b| b.downcast_mut::<Vec<V>>())
    }

    /// Push onto a stack
    pub fn push<V: Any + Send>(&mut self, key: &StackKey<V>, value: V) {
        self.stacks
            .entry((TypeId::of::<V>(), key.name))
            .or_insert_with(|| Box::new(Vec::<V>::new()));
        if let Some(stack) = self.stack_mut(key) {
            stack.push(value);
        }
    }

    /// Pop from a stack
    pub fn pop<V: Any + Send>(&mut self, key: &StackKey<V>) -> Option<V> {
        self.stack_mut(key).and_then(|s| s.pop())
    }

    /// Top of a stack
    pub fn peek<V: Any + Send>(&self, key: &StackKey<V>) -> Option<&V> {
        self.stacks
            .get(&(TypeId::of::<V>(), key.name))
            .and_then(|b| b.downcast_ref::<Vec<V>>())
            .and_then(|s| s.last())
    }

    /// Stack depth
    pub fn stack_depth<V: Any + Send>(&self, key: &StackKey<V>) -> usize {
        self.stacks
            .get(&(TypeId::of::<V>(), key.name))
            .and_then(|b| b.downcast_ref::<Vec<V>>())
            .map_or(0, |s| s.len())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("schema_locks", &self.schema_locks)
            .field("data_locks", &self.data_locks)
            .field("txn_auto_close", &self.txn_auto_close)
            .field("interrupted", &self.interrupt.is_interrupted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Session: Send);
    assert_impl_all!(InterruptToken: Send, Sync);

    static LABEL: Key<String> = Key::new("label");
    static OTHER_LABEL: Key<u32> = Key::new("label");
    static STARTS: StackKey<u64> = StackKey::new("starts");

    #[test]
    fn test_lock_stacks_are_per_kind() {
        let mut s = Session::new();
        s.push_lock(LockKind::Schema, LockMode::Read);
        s.push_lock(LockKind::Data, LockMode::Write);
        assert_eq!(s.lock_depth(LockKind::Schema), 1);
        assert_eq!(s.lock_depth(LockKind::Data), 1);
        assert_eq!(s.top_lock(LockKind::Schema).unwrap().state, AcquireState::Pending);

        assert!(s.mark_acquired(LockKind::Schema));
        assert_eq!(s.top_lock(LockKind::Schema).unwrap().state, AcquireState::Acquired);

        let h = s.pop_lock(LockKind::Data).unwrap();
        assert_eq!(h.mode, LockMode::Write);
        assert_eq!(s.lock_depth(LockKind::Data), 0);
        assert!(!s.mark_acquired(LockKind::Data));
    }

    #[test]
    fn test_txn_markers_lifo() {
        let mut s = Session::new();
        s.push_txn_marker(true);
        s.push_txn_marker(false);
        assert_eq!(s.peek_txn_marker(), Some(false));
        assert_eq!(s.pop_txn_marker(), Some(false));
        assert_eq!(s.pop_txn_marker(), Some(true));
        assert_eq!(s.pop_txn_marker(), None);
    }

    #[test]
    fn test_single_slot_last_write_wins() {
        let mut s = Session::new();
        assert!(s.get(&LABEL).is_none());
        assert_eq!(s.put(&LABEL, "a".to_string()), None);
        assert_eq!(s.put(&LABEL, "b".to_string()), Some("a".to_string()));
        assert_eq!(s.get(&LABEL).map(String::as_str), Some("b"));
        // same name, different type: separate slot
        s.put(&OTHER_LABEL, 7);
        assert_eq!(s.get(&OTHER_LABEL), Some(&7));
        assert_eq!(s.remove(&LABEL), Some("b".to_string()));
        assert!(s.get(&LABEL).is_none());
    }

    #[test]
    fn test_stack_key_lifo() {
        let mut s = Session::new();
        assert_eq!(s.pop(&STARTS), None);
        s.push(&STARTS, 1);
        s.push(&STARTS, 2);
        assert_eq!(s.stack_depth(&STARTS), 2);
        assert_eq!(s.peek(&STARTS), Some(&2));
        assert_eq!(s.pop(&STARTS), Some(2));
        assert_eq!(s.pop(&STARTS), Some(1));
        assert_eq!(s.stack_depth(&STARTS), 0);
    }

    #[test]
    fn test_interrupt_token_shared() {
        let s = Session::new();
        let token = s.interrupt_token();
        assert!(!s.is_interrupted());
        token.interrupt();
        assert!(s.is_interrupted());
        token.clear();
        assert!(!s.is_interrupted());
    }
}
