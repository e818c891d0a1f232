// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Reader/writer lock with same-thread recursion and optional writer preference.
//!
//! The lock state is a single signed counter guarded by one [`FastMutex`](crate::FastMutex):
//!
//! - `count == 0`: free
//! - `count > 0`: held by `count` readers
//! - `count < 0`: held by the writer `owner`, `-count` times
//!
//! A writer that asks for a read lock just nests its write lock one level deeper. Upgrading a
//! read lock to a write lock is not supported.

use core::fmt;
use core::marker::PhantomData;

use bitflags::bitflags;

use crate::monitor::{Monitor, new_condvar};
use crate::policy::report;
use crate::{Error, Result, current_thread_id};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct RwLockFlags: u8 {
        /// Once a writer is waiting, new readers block until it got the lock. Readers that already
        /// hold the lock may still recurse. Implies [`RwLockFlags::TRACK_READERS`].
        const FAVOR_WRITERS = 1 << 0;
        /// Remember which threads hold read locks. Enables detecting a write lock request by a
        /// reader, and unlocks by threads holding no read lock.
        const TRACK_READERS = 1 << 1;
    }
}

struct State {
    count: isize,
    owner: usize,
    waiting_writers: usize,
    readers: Vec<usize>,
}

impl State {
    fn is_reader(&self, id: usize) -> bool {
        self.readers.contains(&id)
    }
}

pub struct RwLock {
    state: Monitor<State>,
    readers: strand_sys::Condvar,
    writers: strand_sys::Condvar,
    flags: RwLockFlags,
}

impl RwLock {
    /// Creates an unlocked `RwLock` without writer preference or reader tracking.
    ///
    /// # Errors
    ///
    /// Fails when the native objects cannot be created.
    pub fn new() -> Result<Self> {
        Self::with_flags(RwLockFlags::empty())
    }

    /// # Errors
    ///
    /// Fails when the native objects cannot be created.
    pub fn with_flags(mut flags: RwLockFlags) -> Result<Self> {
        if flags.contains(RwLockFlags::FAVOR_WRITERS) {
            flags |= RwLockFlags::TRACK_READERS;
        }

        Ok(Self {
            state: Monitor::new(State {
                count: 0,
                owner: 0,
                waiting_writers: 0,
                readers: Vec::new(),
            })?,
            readers: new_condvar()?,
            writers: new_condvar()?,
            flags,
        })
    }

    #[inline]
    pub fn flags(&self) -> RwLockFlags {
        self.flags
    }

    #[inline]
    fn tracks_readers(&self) -> bool {
        self.flags.contains(RwLockFlags::TRACK_READERS)
    }

    /// Tries to take a read lock with the state already locked.
    fn try_read_locked(&self, state: &mut State, id: usize) -> bool {
        if state.count < 0 {
            if state.owner != id {
                return false;
            }
            // The writer reads under its write lock.
            state.count -= 1;
            return true;
        }

        let admitted = !self.flags.contains(RwLockFlags::FAVOR_WRITERS)
            || state.waiting_writers == 0
            || state.is_reader(id);
        if !admitted {
            return false;
        }

        state.count += 1;
        if self.tracks_readers() {
            state.readers.push(id);
        }
        true
    }

    /// Tries to take a write lock with the state already locked.
    fn try_write_locked(state: &mut State, id: usize) -> bool {
        if state.count == 0 {
            state.count = -1;
            state.owner = id;
            true
        } else if state.count < 0 && state.owner == id {
            state.count -= 1;
            true
        } else {
            false
        }
    }

    /// Takes a read lock, blocking while a writer holds the lock (or, with
    /// [`RwLockFlags::FAVOR_WRITERS`], while writers are queued).
    ///
    /// # Errors
    ///
    /// Fails if a native call fails.
    pub fn read_lock(&self) -> Result<()> {
        let id = current_thread_id().get();
        let mut state = self.state.lock()?;

        while !self.try_read_locked(&mut state, id) {
            tracing::trace!(count = state.count, waiting_writers = state.waiting_writers, "reader blocked");
            state.wait(&self.readers)?;
        }
        Ok(())
    }

    /// Like [`RwLock::read_lock`] but returns `false` instead of blocking.
    ///
    /// # Errors
    ///
    /// Fails if a native call fails.
    pub fn try_read_lock(&self) -> Result<bool> {
        let id = current_thread_id().get();
        let mut state = self.state.lock()?;
        Ok(self.try_read_locked(&mut state, id))
    }

    /// Takes the write lock, blocking until no other thread holds the lock. A thread that already
    /// holds the write lock nests it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContractViolation`] if the calling thread holds a read lock (detected with
    /// [`RwLockFlags::TRACK_READERS`], a deadlock otherwise), or fails if a native call fails.
    pub fn write_lock(&self) -> Result<()> {
        let id = current_thread_id().get();
        let mut state = self.state.lock()?;

        if Self::try_write_locked(&mut state, id) {
            return Ok(());
        }
        if state.count > 0 && self.tracks_readers() && state.is_reader(id) {
            return Err(report(Error::ContractViolation(
                "write lock requested while holding a read lock",
            )));
        }

        state.waiting_writers += 1;
        let res = loop {
            if state.count == 0 {
                break Ok(());
            }
            tracing::trace!(count = state.count, "writer blocked");
            if let Err(err) = state.wait(&self.writers) {
                break Err(err);
            }
        };
        state.waiting_writers -= 1;
        res?;

        state.count = -1;
        state.owner = id;
        Ok(())
    }

    /// Like [`RwLock::write_lock`] but returns `false` instead of blocking.
    ///
    /// # Errors
    ///
    /// Fails if a native call fails.
    pub fn try_write_lock(&self) -> Result<bool> {
        let id = current_thread_id().get();
        let mut state = self.state.lock()?;
        Ok(Self::try_write_locked(&mut state, id))
    }

    /// Releases one read lock or one level of the write lock held by the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Owner`] if the lock is not held, if the write lock is held by another
    /// thread, or (with reader tracking) if the calling thread holds no read lock.
    pub fn unlock(&self) -> Result<()> {
        let id = current_thread_id().get();
        let mut state = self.state.lock()?;

        if state.count < 0 {
            if state.owner != id {
                return Err(report(Error::Owner("write lock held by another thread")));
            }
            state.count += 1;
            if state.count == 0 {
                state.owner = 0;
                if state.waiting_writers > 0 {
                    self.writers.notify_one();
                } else {
                    self.readers.notify_all();
                }
            }
        } else if state.count > 0 {
            if self.tracks_readers() {
                let Some(pos) = state.readers.iter().position(|reader| *reader == id) else {
                    return Err(report(Error::Owner("read lock not held by the calling thread")));
                };
                state.readers.swap_remove(pos);
            }
            state.count -= 1;
            if state.count == 0 && state.waiting_writers > 0 {
                self.writers.notify_one();
            }
        } else {
            return Err(report(Error::Owner("unlock of an unlocked rwlock")));
        }
        Ok(())
    }

    /// Takes a read lock that is released when the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// See [`RwLock::read_lock`].
    pub fn read(&self) -> Result<RwLockReadGuard<'_>> {
        self.read_lock()?;
        Ok(RwLockReadGuard {
            rwlock: self,
            _not_send: PhantomData,
        })
    }

    /// Takes the write lock until the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// See [`RwLock::write_lock`].
    pub fn write(&self) -> Result<RwLockWriteGuard<'_>> {
        self.write_lock()?;
        Ok(RwLockWriteGuard {
            rwlock: self,
            _not_send: PhantomData,
        })
    }

    /// Whether some thread holds the write lock.
    ///
    /// # Errors
    ///
    /// Fails if a native call fails.
    pub fn is_write_locked(&self) -> Result<bool> {
        Ok(self.state.lock()?.count < 0)
    }

    /// Number of read locks currently held.
    ///
    /// # Errors
    ///
    /// Fails if a native call fails.
    pub fn reader_count(&self) -> Result<usize> {
        Ok(self.state.lock()?.count.try_into().unwrap_or(0))
    }
}

impl Drop for RwLock {
    fn drop(&mut self) {
        if self.state.get_mut().count != 0 {
            report(Error::ContractViolation("rwlock destroyed while locked"));
        }
    }
}

impl fmt::Debug for RwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("RwLock");
        s.field("flags", &self.flags);
        match self.state.lock() {
            Ok(state) => s
                .field("count", &state.count)
                .field("owner", &state.owner)
                .field("waiting_writers", &state.waiting_writers)
                .finish_non_exhaustive(),
            Err(_) => s.finish_non_exhaustive(),
        }
    }
}

/// RAII structure used to release a read lock when dropped.
#[clippy::has_significant_drop]
#[must_use = "if unused the RwLock will immediately unlock"]
pub struct RwLockReadGuard<'a> {
    rwlock: &'a RwLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for RwLockReadGuard<'_> {
    fn drop(&mut self) {
        let _ = self.rwlock.unlock();
    }
}

/// RAII structure used to release the write lock when dropped.
#[clippy::has_significant_drop]
#[must_use = "if unused the RwLock will immediately unlock"]
pub struct RwLockWriteGuard<'a> {
    rwlock: &'a RwLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for RwLockWriteGuard<'_> {
    fn drop(&mut self) {
        let _ = self.rwlock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::ErrorKind;

    const MAX_READERS: usize = 50;

    /// Assert that a write lock cannot be obtained while read locks are held
    #[test]
    fn writer_waits_for_readers() {
        let _trace = crate::test_util::setup();
        let l = Arc::new(RwLock::new().unwrap());

        for _ in 0..MAX_READERS {
            assert!(l.try_read_lock().unwrap());
        }

        let other = l.clone();
        assert!(!thread::spawn(move || other.try_write_lock().unwrap()).join().unwrap());

        for _ in 0..MAX_READERS {
            l.unlock().unwrap();
        }

        assert!(l.try_write_lock().unwrap());
        l.unlock().unwrap();
    }

    /// Assert that read locks cannot be obtained while a write lock is held
    #[test]
    fn readers_wait_for_writer() {
        let _trace = crate::test_util::setup();
        let l = Arc::new(RwLock::new().unwrap());

        assert!(l.try_write_lock().unwrap());
        assert!(l.is_write_locked().unwrap());

        let other = l.clone();
        assert!(!thread::spawn(move || other.try_read_lock().unwrap()).join().unwrap());

        l.unlock().unwrap();
        assert!(!l.is_write_locked().unwrap());

        for _ in 0..MAX_READERS {
            assert!(l.try_read_lock().unwrap());
        }
        assert_eq!(l.reader_count().unwrap(), MAX_READERS);
        for _ in 0..MAX_READERS {
            l.unlock().unwrap();
        }
    }

    #[test]
    fn writer_recursion_and_nested_read() {
        let _trace = crate::test_util::setup();
        let l = RwLock::new().unwrap();

        l.write_lock().unwrap();
        l.write_lock().unwrap();
        // a read by the writer nests the write lock
        l.read_lock().unwrap();
        assert!(l.try_write_lock().unwrap());
        assert_eq!(l.reader_count().unwrap(), 0);

        for _ in 0..4 {
            assert!(l.is_write_locked().unwrap());
            l.unlock().unwrap();
        }
        assert!(!l.is_write_locked().unwrap());
        assert_eq!(l.unlock().unwrap_err().kind(), ErrorKind::Owner);
    }

    #[test]
    fn upgrade_is_a_contract_violation() {
        let _trace = crate::test_util::setup();
        let l = RwLock::with_flags(RwLockFlags::TRACK_READERS).unwrap();

        l.read_lock().unwrap();
        assert_eq!(l.write_lock().unwrap_err().kind(), ErrorKind::ContractViolation);
        l.unlock().unwrap();

        l.write_lock().unwrap();
        l.unlock().unwrap();
    }

    #[test]
    fn tracked_reader_unlock_by_stranger() {
        let _trace = crate::test_util::setup();
        let l = Arc::new(RwLock::with_flags(RwLockFlags::TRACK_READERS).unwrap());

        l.read_lock().unwrap();
        let other = l.clone();
        let kind = thread::spawn(move || other.unlock().unwrap_err().kind())
            .join()
            .unwrap();
        assert_eq!(kind, ErrorKind::Owner);
        assert_eq!(l.reader_count().unwrap(), 1);
        l.unlock().unwrap();
    }

    #[test]
    fn writer_unlock_by_stranger() {
        let _trace = crate::test_util::setup();
        let l = Arc::new(RwLock::new().unwrap());

        l.write_lock().unwrap();
        let other = l.clone();
        let kind = thread::spawn(move || other.unlock().unwrap_err().kind())
            .join()
            .unwrap();
        assert_eq!(kind, ErrorKind::Owner);
        l.unlock().unwrap();
    }

    #[test]
    fn favor_writers_implies_tracking() {
        let l = RwLock::with_flags(RwLockFlags::FAVOR_WRITERS).unwrap();
        assert!(l.flags().contains(RwLockFlags::TRACK_READERS));
    }

    /// Thread A takes the write lock, thread B's read lock blocks until A unlocks.
    #[test]
    fn read_blocks_until_write_released() {
        let _trace = crate::test_util::setup();
        let l = Arc::new(RwLock::new().unwrap());
        let acquired = Arc::new(AtomicBool::new(false));

        l.write_lock().unwrap();

        let reader = thread::spawn({
            let l = l.clone();
            let acquired = acquired.clone();
            move || {
                l.read_lock().unwrap();
                acquired.store(true, Ordering::SeqCst);
                assert!(!l.is_write_locked().unwrap());
                l.unlock().unwrap();
            }
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        l.unlock().unwrap();
        reader.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn favor_writers_blocks_new_readers_but_not_recursion() {
        let _trace = crate::test_util::setup();
        let l = Arc::new(RwLock::with_flags(RwLockFlags::FAVOR_WRITERS).unwrap());

        l.read_lock().unwrap();

        let (queued_tx, queued_rx) = mpsc::channel();
        let writer = thread::spawn({
            let l = l.clone();
            move || {
                queued_tx.send(()).unwrap();
                l.write_lock().unwrap();
                l.unlock().unwrap();
            }
        });
        queued_rx.recv().unwrap();
        // give the writer time to register as waiting
        while l.state.lock().unwrap().waiting_writers == 0 {
            thread::yield_now();
        }

        // a new reader must wait for the queued writer ...
        let other = l.clone();
        assert!(!thread::spawn(move || other.try_read_lock().unwrap()).join().unwrap());
        // ... but we already are a reader and may recurse
        assert!(l.try_read_lock().unwrap());

        l.unlock().unwrap();
        l.unlock().unwrap();
        writer.join().unwrap();
    }

    /// A writer queued against eight readers that keep re-acquiring the lock gets through.
    #[test]
    fn favor_writers_prevents_starvation() {
        const READERS: usize = 8;
        const MAX_CYCLES: usize = 100_000;

        let _trace = crate::test_util::setup();
        let l = Arc::new(RwLock::with_flags(RwLockFlags::FAVOR_WRITERS).unwrap());
        let done = Arc::new(AtomicBool::new(false));
        let cycles = Arc::new(AtomicUsize::new(0));

        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                let l = l.clone();
                let done = done.clone();
                let cycles = cycles.clone();
                thread::spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        l.read_lock().unwrap();
                        cycles.fetch_add(1, Ordering::SeqCst);
                        thread::yield_now();
                        l.unlock().unwrap();
                    }
                })
            })
            .collect();

        // let the readers saturate the lock first
        while cycles.load(Ordering::SeqCst) < READERS * 10 {
            thread::yield_now();
        }

        let start = cycles.load(Ordering::SeqCst);
        l.write_lock().unwrap();
        let waited = cycles.load(Ordering::SeqCst) - start;
        l.unlock().unwrap();

        done.store(true, Ordering::SeqCst);
        for r in readers {
            r.join().unwrap();
        }

        assert!(waited < MAX_CYCLES, "writer waited {waited} reader cycles");
    }

    /// Randomized mix of readers and writers, sampling that readers and a writer never hold the
    /// lock at the same time.
    #[test]
    fn concurrent_readers_and_writers() {
        const CYCLES: usize = 500;

        lazy_static::lazy_static! {
            static ref L: RwLock = RwLock::with_flags(RwLockFlags::FAVOR_WRITERS).unwrap();
            static ref READERS: AtomicIsize = AtomicIsize::new(0);
            static ref WRITERS: AtomicIsize = AtomicIsize::new(0);
        }

        let _trace = crate::test_util::setup();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                thread::spawn(|| {
                    for _ in 0..CYCLES {
                        if rand::random_bool(0.1) {
                            let _guard = L.write().unwrap();
                            assert_eq!(WRITERS.fetch_add(1, Ordering::SeqCst), 0);
                            assert_eq!(READERS.load(Ordering::SeqCst), 0);
                            WRITERS.fetch_sub(1, Ordering::SeqCst);
                        } else {
                            let _guard = L.read().unwrap();
                            READERS.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(WRITERS.load(Ordering::SeqCst), 0);
                            READERS.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(L.reader_count().unwrap(), 0);
        assert!(!L.is_write_locked().unwrap());
    }
}
