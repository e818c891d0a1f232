// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Portable backend built from `std` primitives, for hosts without pthreads.

use core::cell::RefCell;
use core::ffi::c_void;
use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use std::collections::BTreeMap;
use std::io;
use std::sync::{self, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use crate::{Dtor, ThreadMain};

// None of the internal locks are held across user code, so poisoning carries no information.
fn lock<T>(m: &sync::Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// === impl Mutex ===

pub struct Mutex {
    owner: sync::Mutex<Option<ThreadId>>,
    unlocked: sync::Condvar,
}

impl Mutex {
    /// # Errors
    ///
    /// Never fails, the signature matches the native backends.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            owner: sync::Mutex::new(None),
            unlocked: sync::Condvar::new(),
        })
    }

    /// # Errors
    ///
    /// Reports a deadlock if the calling thread already holds the mutex.
    pub fn lock(&self) -> io::Result<()> {
        let me = thread::current().id();
        let mut owner = lock(&self.owner);
        loop {
            match *owner {
                None => {
                    *owner = Some(me);
                    return Ok(());
                }
                Some(id) if id == me => {
                    return Err(io::Error::other("mutex already locked by the calling thread"));
                }
                Some(_) => {
                    owner = self
                        .unlocked
                        .wait(owner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// # Errors
    ///
    /// Never fails, the signature matches the native backends.
    pub fn try_lock(&self) -> io::Result<bool> {
        let mut owner = lock(&self.owner);
        if owner.is_some() {
            Ok(false)
        } else {
            *owner = Some(thread::current().id());
            Ok(true)
        }
    }

    /// # Errors
    ///
    /// Reports a permission error if the calling thread does not hold the mutex.
    pub fn unlock(&self) -> io::Result<()> {
        let mut owner = lock(&self.owner);
        if *owner != Some(thread::current().id()) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "mutex not locked by the calling thread",
            ));
        }
        *owner = None;
        drop(owner);
        self.unlocked.notify_one();
        Ok(())
    }
}

// === impl Condvar ===

/// Waiters remember the notification sequence number they started waiting at and return once it
/// moved on. `seq` is taken before the user mutex is released, so a notification issued between
/// the release and the wait cannot be lost.
pub struct Condvar {
    seq: sync::Mutex<u64>,
    cvar: sync::Condvar,
}

impl Condvar {
    /// # Errors
    ///
    /// Never fails, the signature matches the native backends.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            seq: sync::Mutex::new(0),
            cvar: sync::Condvar::new(),
        })
    }

    /// # Errors
    ///
    /// Fails if `mutex` is not held by the calling thread.
    pub fn wait(&self, mutex: &Mutex) -> io::Result<()> {
        let mut seq = lock(&self.seq);
        let start = *seq;
        mutex.unlock()?;
        while *seq == start {
            seq = self.cvar.wait(seq).unwrap_or_else(PoisonError::into_inner);
        }
        drop(seq);
        mutex.lock()
    }

    /// Returns `true` if the wait timed out.
    ///
    /// # Errors
    ///
    /// Fails if `mutex` is not held by the calling thread.
    pub fn wait_timeout(&self, mutex: &Mutex, dur: Duration) -> io::Result<bool> {
        let deadline = Instant::now().checked_add(dur);
        let mut seq = lock(&self.seq);
        let start = *seq;
        mutex.unlock()?;

        let mut timed_out = false;
        while *seq == start {
            let Some(deadline) = deadline else {
                seq = self.cvar.wait(seq).unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                timed_out = true;
                break;
            }
            seq = self
                .cvar
                .wait_timeout(seq, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        drop(seq);
        mutex.lock()?;
        Ok(timed_out)
    }

    pub fn notify_one(&self) {
        let mut seq = lock(&self.seq);
        *seq = seq.wrapping_add(1);
        self.cvar.notify_one();
    }

    pub fn notify_all(&self) {
        let mut seq = lock(&self.seq);
        *seq = seq.wrapping_add(1);
        self.cvar.notify_all();
    }
}

// === impl TlsKey ===

static NEXT_KEY: AtomicUsize = AtomicUsize::new(1);
/// Destructors of all keys that have not been deleted yet.
static LIVE_KEYS: sync::Mutex<BTreeMap<usize, Option<Dtor>>> = sync::Mutex::new(BTreeMap::new());

/// The calling thread's values, its destructors run when the thread exits.
struct LocalValues(BTreeMap<usize, *mut c_void>);

impl Drop for LocalValues {
    fn drop(&mut self) {
        // Destructors may set new values on other keys, those are dropped silently since this
        // thread's storage is already gone.
        for (key, value) in mem::take(&mut self.0) {
            if value.is_null() {
                continue;
            }
            let dtor = lock(&LIVE_KEYS).get(&key).copied().flatten();
            if let Some(dtor) = dtor {
                // Safety: the key is still live and `value` was stored by this thread
                unsafe { dtor(value) }
            }
        }
    }
}

thread_local! {
    static VALUES: RefCell<LocalValues> = const { RefCell::new(LocalValues(BTreeMap::new())) };
}

pub struct TlsKey {
    key: usize,
}

impl TlsKey {
    /// # Errors
    ///
    /// Never fails, the signature matches the native backends.
    pub fn new(dtor: Option<Dtor>) -> io::Result<Self> {
        let key = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
        lock(&LIVE_KEYS).insert(key, dtor);
        Ok(Self { key })
    }

    /// Returns the calling thread's value, null if it never set one or its storage was already
    /// destroyed.
    pub fn get(&self) -> *mut u8 {
        VALUES
            .try_with(|values| {
                values
                    .borrow()
                    .0
                    .get(&self.key)
                    .map_or(core::ptr::null_mut(), |value| value.cast::<u8>())
            })
            .unwrap_or(core::ptr::null_mut())
    }

    /// # Errors
    ///
    /// Fails when called while the calling thread's storage is being destroyed.
    pub fn set(&self, value: *mut u8) -> io::Result<()> {
        VALUES
            .try_with(|values| {
                let mut values = values.borrow_mut();
                if value.is_null() {
                    values.0.remove(&self.key);
                } else {
                    values.0.insert(self.key, value.cast());
                }
            })
            .map_err(|_| io::Error::other("thread-local storage already destroyed"))
    }
}

impl Drop for TlsKey {
    fn drop(&mut self) {
        lock(&LIVE_KEYS).remove(&self.key);
    }
}

// === impl Thread ===

pub struct Thread {
    handle: JoinHandle<()>,
}

impl Thread {
    /// # Errors
    ///
    /// Returns the error reported by the OS when the thread could not be created.
    pub fn spawn(stack_size: Option<usize>, main: ThreadMain) -> io::Result<Thread> {
        let mut builder = thread::Builder::new();
        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }
        let handle = builder.spawn(main)?;
        Ok(Thread { handle })
    }

    /// # Errors
    ///
    /// Fails if the thread panicked.
    pub fn join(self) -> io::Result<()> {
        self.handle
            .join()
            .map_err(|_| io::Error::other("joined thread panicked"))
    }

    /// # Errors
    ///
    /// Never fails, the signature matches the native backends.
    pub fn detach(self) -> io::Result<()> {
        drop(self.handle);
        Ok(())
    }
}
