// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Sync primitives that require thread-local storage.

use core::num::NonZeroUsize;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use lock_api::GetThreadId;

use crate::policy::report;
use crate::{Error, FastMutex, Result};

/// A mutex which can be recursively locked by a single thread, protecting some data.
///
/// A `ReentrantMutexGuard` does not give mutable references to the locked data. A
/// [`RefCell`](core::cell::RefCell) can be used to achieve this.
pub type ReentrantMutex<T> = lock_api::ReentrantMutex<FastMutex, CurrentThreadId, T>;
/// RAII structure used to release reentrant lock when dropped.
///
/// If the lock has been held recursively the lock will be released when the last
/// `ReentrantMutexGuard` is dropped.
pub type ReentrantMutexGuard<'a, T> = lock_api::ReentrantMutexGuard<'a, FastMutex, CurrentThreadId, T>;

/// Returns a unique, non-zero identifier for the calling thread.
///
/// The identifier is *not* human-readable, sequential or stable across runs, and may be reused
/// once the thread has exited.
#[inline]
pub fn current_thread_id() -> NonZeroUsize {
    // The address of a thread-local variable is unique to the current thread and non-zero. The
    // variable has to have a non-zero size to get a unique address per thread.
    thread_local! {
        static X: u8 = const { 0 };
    }
    X.with(|x| NonZeroUsize::new(ptr::from_ref(x).addr()).unwrap_or(NonZeroUsize::MIN))
}

/// [`GetThreadId`] implementation backed by [`current_thread_id`].
pub struct CurrentThreadId;

// Safety: `current_thread_id` never returns the same value for two threads that are alive at the
// same time
unsafe impl GetThreadId for CurrentThreadId {
    const INIT: Self = CurrentThreadId;

    fn nonzero_thread_id(&self) -> NonZeroUsize {
        current_thread_id()
    }
}

/// A mutex which can be locked multiple times by the thread that holds it.
///
/// The first [`lock`](RecursiveMutex::lock) by a thread takes the underlying [`FastMutex`];
/// every further `lock` by the same thread only increments a counter. The mutex is released once
/// [`unlock`](RecursiveMutex::unlock) was called as often as `lock`.
///
/// Dropping a `RecursiveMutex` that is still locked is a contract violation.
pub struct RecursiveMutex {
    mutex: FastMutex,
    owner: AtomicUsize,
    // Only ever touched by the owning thread.
    count: AtomicUsize,
}

impl RecursiveMutex {
    /// # Errors
    ///
    /// Fails when the native mutex cannot be created.
    pub fn new() -> Result<Self> {
        Ok(Self {
            mutex: FastMutex::new()?,
            owner: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
        })
    }

    #[inline]
    fn lock_internal(&self, lock_inner: impl FnOnce() -> Result<bool>) -> Result<bool> {
        let id = current_thread_id().get();

        if self.owner.load(Ordering::Relaxed) == id {
            let count = self
                .count
                .load(Ordering::Relaxed)
                .checked_add(1)
                .ok_or_else(|| report(Error::ContractViolation("recursive mutex lock count overflow")))?;
            self.count.store(count, Ordering::Relaxed);
        } else {
            if !lock_inner()? {
                return Ok(false);
            }
            self.owner.store(id, Ordering::Relaxed);
            debug_assert_eq!(self.count.load(Ordering::Relaxed), 0);
            self.count.store(1, Ordering::Relaxed);
        }
        Ok(true)
    }

    /// Acquires the mutex, blocking the current thread until it is able to do so.
    ///
    /// If the mutex is already held by the current thread, this increments the lock count and
    /// returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lock`] if the native call fails.
    pub fn lock(&self) -> Result<()> {
        self.lock_internal(|| self.mutex.lock().map(|()| true))
            .map(|_| ())
    }

    /// Attempts to acquire the mutex without blocking.
    ///
    /// Always succeeds if the current thread already holds the mutex.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TryLock`] if the native call fails.
    pub fn try_lock(&self) -> Result<bool> {
        self.lock_internal(|| self.mutex.try_lock())
    }

    /// Releases one level of locking.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Owner`] if the current thread does not hold the mutex, which includes
    /// unlocking a mutex that is not locked at all.
    pub fn unlock(&self) -> Result<()> {
        let id = current_thread_id().get();
        if self.owner.load(Ordering::Relaxed) != id {
            return Err(report(Error::Owner("recursive mutex not held by the calling thread")));
        }

        let count = self.count.load(Ordering::Relaxed) - 1;
        self.count.store(count, Ordering::Relaxed);
        if count == 0 {
            self.owner.store(0, Ordering::Relaxed);
            self.mutex.unlock()?;
        }
        Ok(())
    }

    /// Checks whether the mutex is currently held by the current thread.
    #[inline]
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_thread_id().get()
    }

    /// How many times the current thread has locked the mutex, 0 if it does not hold it.
    #[inline]
    pub fn lock_count(&self) -> usize {
        if self.is_owned_by_current_thread() {
            self.count.load(Ordering::Relaxed)
        } else {
            0
        }
    }
}

impl Drop for RecursiveMutex {
    fn drop(&mut self) {
        if *self.count.get_mut() != 0 {
            report(Error::ContractViolation("recursive mutex destroyed while locked"));
        }
    }
}

impl core::fmt::Debug for RecursiveMutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RecursiveMutex")
            .field("mutex", &self.mutex)
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .field("count", &self.count.load(Ordering::Relaxed))
            .finish()
    }
}
