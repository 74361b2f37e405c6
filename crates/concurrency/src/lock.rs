//! Fair reentrant reader/writer lock
//!
//! Ownership is tracked per OS thread, which is what makes reentrancy and the
//! "write-locked by another thread" check possible.
//!
//! ## Rules
//!
//! - Waiters are granted in arrival order. A waiting writer blocks readers
//!   that arrive after it, so writers cannot starve.
//! - A thread already holding the read lock takes further reads immediately.
//! - The write holder may take the write lock again and may take read locks.
//! - A read holder asking for the write lock is a protocol violation: the
//!   upgrade would wait for itself forever.
//!
//! Blocking waits come in three flavours, see [`Acquisition`].

use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use strata_core::error::{DxlError, Result};
use strata_core::session::{InterruptToken, LockKind, LockMode};

/// Poll interval while waiting interruptibly
const INTERRUPT_POLL: Duration = Duration::from_millis(10);

/// How a blocked acquisition waits
#[derive(Debug, Clone)]
pub enum Acquisition {
    /// Wait until granted
    Blocking,
    /// Wait until granted or the token is set
    Interruptible(InterruptToken),
    /// Wait at most this long
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    ticket: u64,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct LockState {
    writer: Option<ThreadId>,
    write_depth: u32,
    readers: FxHashMap<ThreadId, u32>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

impl LockState {
    fn grantable(&self, ticket: u64, mode: LockMode) -> bool {
        if self.writer.is_some() {
            return false;
        }
        match mode {
            LockMode::Read => self
                .queue
                .iter()
                .take_while(|w| w.ticket != ticket)
                .all(|w| w.mode == LockMode::Read),
            LockMode::Write => {
                self.readers.is_empty() && self.queue.front().map(|w| w.ticket) == Some(ticket)
            }
        }
    }

    fn dequeue(&mut self, ticket: u64) {
        if let Some(pos) = self.queue.iter().position(|w| w.ticket == ticket) {
            self.queue.remove(pos);
        }
    }

    fn grant(&mut self, me: ThreadId, mode: LockMode) {
        match mode {
            LockMode::Read => *self.readers.entry(me).or_insert(0) += 1,
            LockMode::Write => {
                self.writer = Some(me);
                self.write_depth = 1;
            }
        }
    }
}

/// Snapshot of a lock for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStatus {
    /// Lock kind
    pub kind: LockKind,
    /// Thread holding the write lock
    pub writer: Option<ThreadId>,
    /// Write reentrancy depth
    pub write_depth: u32,
    /// Threads holding read locks
    pub reader_threads: usize,
    /// Total read holds across threads
    pub read_holds: u32,
    /// Blocked acquisitions
    pub waiting: usize,
}

/// Fair reentrant reader/writer lock
#[derive(Debug)]
pub struct FairRwLock {
    kind: LockKind,
    state: Mutex<LockState>,
    cond: Condvar,
}

impl FairRwLock {
    /// Create an unlocked lock
    pub fn new(kind: LockKind) -> Self {
        Self {
            kind,
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
        }
    }

    /// Lock kind
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    /// Thread holding the write lock, if any
    pub fn write_owner(&self) -> Option<ThreadId> {
        self.state.lock().writer
    }

    /// Acquire in `mode`, waiting as described by `how`
    ///
    /// # Errors
    ///
    /// - `ProtocolViolation` for a read-to-write upgrade
    /// - `Interrupted` when the token is set while waiting; the token is
    ///   cleared again
    /// - `LockTimeout` when the timeout elapses
    pub fn acquire(&self, mode: LockMode, how: &Acquisition) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        // Reentrant paths never queue
        if state.writer == Some(me) {
            match mode {
                LockMode::Write => state.write_depth += 1,
                LockMode::Read => *state.readers.entry(me).or_insert(0) += 1,
            }
            return Ok(());
        }
        if state.readers.contains_key(&me) {
            return match mode {
                LockMode::Read => {
                    *state.readers.entry(me).or_insert(0) += 1;
                    Ok(())
                }
                LockMode::Write => Err(DxlError::protocol(format!(
                    "thread holding the {} read lock requested the write lock",
                    self.kind
                ))),
            };
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(Waiter { ticket, mode });

        let deadline = match how {
            Acquisition::Timeout(t) => Some(Instant::now() + *t),
            _ => None,
        };

        while !state.grantable(ticket, mode) {
            match how {
                Acquisition::Blocking => self.cond.wait(&mut state),
                Acquisition::Interruptible(token) => {
                    if token.is_interrupted() {
                        // Reporting the interrupt consumes it
                        token.clear();
                        return Err(self.abandon(&mut state, ticket, DxlError::Interrupted { kind: self.kind }));
                    }
                    let _ = self.cond.wait_for(&mut state, INTERRUPT_POLL);
                }
                Acquisition::Timeout(timeout) => {
                    let expired = match deadline {
                        Some(d) => self.cond.wait_until(&mut state, d).timed_out(),
                        None => false,
                    };
                    if expired && !state.grantable(ticket, mode) {
                        let err = DxlError::LockTimeout {
                            kind: self.kind,
                            timeout: *timeout,
                        };
                        return Err(self.abandon(&mut state, ticket, err));
                    }
                }
            }
        }

        state.dequeue(ticket);
        state.grant(me, mode);
        // Readers queued behind this one may now be grantable too
        self.cond.notify_all();
        Ok(())
    }

    fn abandon(&self, state: &mut MutexGuard<'_, LockState>, ticket: u64, err: DxlError) -> DxlError {
        state.dequeue(ticket);
        self.cond.notify_all();
        err
    }

    /// Release one hold in `mode` taken by the current thread
    pub fn release(&self, mode: LockMode) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match mode {
            LockMode::Write => {
                if state.writer != Some(me) {
                    return Err(DxlError::protocol(format!(
                        "{} write lock released by a thread that does not hold it",
                        self.kind
                    )));
                }
                state.write_depth -= 1;
                if state.write_depth == 0 {
                    state.writer = None;
                }
            }
            LockMode::Read => match state.readers.get_mut(&me) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    state.readers.remove(&me);
                }
                None => {
                    return Err(DxlError::protocol(format!(
                        "{} read lock released by a thread that does not hold it",
                        self.kind
                    )))
                }
            },
        }
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    /// Diagnostic snapshot
    pub fn status(&self) -> LockStatus {
        let state = self.state.lock();
        LockStatus {
            kind: self.kind,
            writer: state.writer,
            write_depth: state.write_depth,
            reader_threads: state.readers.len(),
            read_holds: state.readers.values().sum(),
            waiting: state.queue.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    assert_impl_all!(FairRwLock: Send, Sync);

    #[test]
    fn test_reentrant_read_and_write() {
        let lock = FairRwLock::new(LockKind::Schema);
        lock.acquire(LockMode::Write, &Acquisition::Blocking).unwrap();
        lock.acquire(LockMode::Write, &Acquisition::Blocking).unwrap();
        lock.acquire(LockMode::Read, &Acquisition::Blocking).unwrap();
        let status = lock.status();
        assert_eq!(status.write_depth, 2);
        assert_eq!(status.read_holds, 1);

        lock.release(LockMode::Read).unwrap();
        lock.release(LockMode::Write).unwrap();
        lock.release(LockMode::Write).unwrap();
        assert_eq!(lock.write_owner(), None);
    }

    #[test]
    fn test_read_to_write_upgrade_rejected() {
        let lock = FairRwLock::new(LockKind::Data);
        lock.acquire(LockMode::Read, &Acquisition::Blocking).unwrap();
        let err = lock.acquire(LockMode::Write, &Acquisition::Blocking).unwrap_err();
        assert!(matches!(err, DxlError::ProtocolViolation { .. }));
        lock.release(LockMode::Read).unwrap();
        assert_eq!(lock.status().reader_threads, 0);
    }

    #[test]
    fn test_release_without_hold() {
        let lock = FairRwLock::new(LockKind::Schema);
        assert!(lock.release(LockMode::Read).is_err());
        assert!(lock.release(LockMode::Write).is_err());
    }

    #[test]
    fn test_timeout_while_write_held_elsewhere() {
        let lock = Arc::new(FairRwLock::new(LockKind::Schema));
        lock.acquire(LockMode::Write, &Acquisition::Blocking).unwrap();

        let l = Arc::clone(&lock);
        let err = thread::spawn(move || {
            l.acquire(LockMode::Read, &Acquisition::Timeout(Duration::from_millis(30)))
        })
        .join()
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, DxlError::LockTimeout { kind: LockKind::Schema, .. }));
        assert_eq!(lock.status().waiting, 0);
        lock.release(LockMode::Write).unwrap();
    }

    #[test]
    fn test_interruptible_wait() {
        let lock = Arc::new(FairRwLock::new(LockKind::Schema));
        lock.acquire(LockMode::Write, &Acquisition::Blocking).unwrap();

        let token = InterruptToken::new();
        let l = Arc::clone(&lock);
        let t = token.clone();
        let waiter = thread::spawn(move || l.acquire(LockMode::Write, &Acquisition::Interruptible(t)));
        thread::sleep(Duration::from_millis(30));
        token.interrupt();
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, DxlError::Interrupted { .. }));
        assert!(!token.is_interrupted());
        lock.release(LockMode::Write).unwrap();
    }

    #[test]
    fn test_wait_after_interrupt_blocks_again() {
        let lock = Arc::new(FairRwLock::new(LockKind::Schema));
        let token = InterruptToken::new();

        let (l, t) = (Arc::clone(&lock), token.clone());
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();
        let holder = thread::spawn(move || {
            l.acquire(LockMode::Write, &Acquisition::Blocking).unwrap();
            held_tx.send(()).unwrap();
            go_rx.recv().unwrap();
            l.release(LockMode::Write).unwrap();
        });
        held_rx.recv().unwrap();

        t.interrupt();
        let err = lock.acquire(LockMode::Read, &Acquisition::Interruptible(token.clone())).unwrap_err();
        assert!(matches!(err, DxlError::Interrupted { kind: LockKind::Schema }));
        assert_eq!(lock.status().waiting, 0);

        // No new interrupt: the second wait lasts until the holder lets go
        let l = Arc::clone(&lock);
        let t = token.clone();
        let waiter = thread::spawn(move || {
            let started = Instant::now();
            let acquired = l.acquire(LockMode::Read, &Acquisition::Interruptible(t));
            if acquired.is_ok() {
                l.release(LockMode::Read).unwrap();
            }
            (acquired, started.elapsed())
        });
        while lock.status().waiting == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(30));
        assert_eq!(lock.status().waiting, 1);
        go_tx.send(()).unwrap();

        let (acquired, waited) = waiter.join().unwrap();
        acquired.unwrap();
        assert!(waited >= Duration::from_millis(30));
        holder.join().unwrap();
    }

    #[test]
    fn test_waiting_writer_blocks_new_readers() {
        let lock = Arc::new(FairRwLock::new(LockKind::Schema));
        lock.acquire(LockMode::Read, &Acquisition::Blocking).unwrap();

        let writer_done = Arc::new(AtomicBool::new(false));
        let (l, done) = (Arc::clone(&lock), Arc::clone(&writer_done));
        let writer = thread::spawn(move || {
            l.acquire(LockMode::Write, &Acquisition::Blocking).unwrap();
            done.store(true, Ordering::SeqCst);
            l.release(LockMode::Write).unwrap();
        });
        while lock.status().waiting == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        // A new reader on another thread queues behind the writer
        let l = Arc::clone(&lock);
        let late_reader = thread::spawn(move || {
            l.acquire(LockMode::Read, &Acquisition::Timeout(Duration::from_millis(50)))
        });
        assert!(late_reader.join().unwrap().is_err());
        assert!(!writer_done.load(Ordering::SeqCst));

        lock.release(LockMode::Read).unwrap();
        writer.join().unwrap();
        assert!(writer_done.load(Ordering::SeqCst));
    }
}
