// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::OnceLock;

use crate::policy::{raise, report};
use crate::{Error, Result};

/// A mutual exclusion primitive protecting some data, built on [`FastMutex`].
pub type Mutex<T> = lock_api::Mutex<FastMutex, T>;
/// An RAII guard of a [`Mutex`], the mutex is unlocked when it is dropped.
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, FastMutex, T>;

/// A thin wrapper around one native, non-recursive mutex.
///
/// There is no owner tracking: locking a `FastMutex` twice from the same thread is a bug. Use
/// [`RecursiveMutex`](crate::RecursiveMutex) when re-entrant locking is needed.
///
/// A `FastMutex` is either created ready to use with [`FastMutex::new`], or created
/// [uninitialized](FastMutex::UNINIT) (e.g. in a `static`) and set up later with
/// [`FastMutex::init`]. Using it before initialization, or initializing it twice, is an
/// [`Error::Initialization`].
///
/// Through its [`lock_api::RawMutex`] implementation, which backs [`Mutex`], the native mutex is
/// instead created lazily and race-free on first use.
pub struct FastMutex {
    native: OnceLock<strand_sys::Mutex>,
}

impl FastMutex {
    /// A mutex that still needs [`FastMutex::init`].
    #[expect(clippy::declare_interior_mutable_const, reason = "used as an initializer")]
    pub const UNINIT: Self = Self::uninit();

    #[must_use]
    pub const fn uninit() -> Self {
        Self {
            native: OnceLock::new(),
        }
    }

    /// Creates an initialized, unlocked mutex.
    ///
    /// # Errors
    ///
    /// Fails when the native mutex cannot be created.
    pub fn new() -> Result<Self> {
        let mutex = Self::uninit();
        mutex.init()?;
        Ok(mutex)
    }

    /// Creates the native mutex.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Initialization`] if the mutex was already initialized and
    /// [`Error::NativeInit`] if the native mutex cannot be created.
    pub fn init(&self) -> Result<()> {
        if self.is_initialized() {
            return Err(report(Error::Initialization("mutex initialized twice")));
        }
        let native = strand_sys::Mutex::new().map_err(|err| report(Error::NativeInit(err)))?;
        self.native
            .set(native)
            .map_err(|_| report(Error::Initialization("mutex initialized twice")))
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.native.get().is_some()
    }

    /// Returns the native mutex, for waiting on condition variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Initialization`] if the mutex was never initialized.
    pub fn native(&self) -> Result<&strand_sys::Mutex> {
        self.native
            .get()
            .ok_or_else(|| report(Error::Initialization("mutex used before initialization")))
    }

    fn native_or_init(&self) -> &strand_sys::Mutex {
        self.native
            .get_or_init(|| strand_sys::Mutex::new().unwrap_or_else(|err| raise(Error::NativeInit(err))))
    }

    /// Blocks until the calling thread holds the mutex.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lock`] if the native call fails, which includes the calling thread already
    /// holding the mutex.
    pub fn lock(&self) -> Result<()> {
        self.native()?
            .lock()
            .map_err(|err| report(Error::Lock(err)))
    }

    /// Takes the mutex if it is free, without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TryLock`] if the native call fails.
    pub fn try_lock(&self) -> Result<bool> {
        self.native()?
            .try_lock()
            .map_err(|err| report(Error::TryLock(err)))
    }

    /// # Errors
    ///
    /// Returns [`Error::Unlock`] if the native call fails, e.g. because the calling thread does
    /// not hold the mutex.
    pub fn unlock(&self) -> Result<()> {
        self.native()?
            .unlock()
            .map_err(|err| report(Error::Unlock(err)))
    }
}

impl Drop for FastMutex {
    fn drop(&mut self) {
        let Some(native) = self.native.get() else {
            return;
        };
        match native.try_lock() {
            Ok(true) => {
                let _ = native.unlock();
            }
            // The native mutex leaks itself in this case.
            _ => {
                report(Error::ContractViolation("mutex destroyed while locked"));
            }
        }
    }
}

impl core::fmt::Debug for FastMutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FastMutex")
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

// Safety: `lock` and `try_lock` only return once the native mutex is held, and native mutexes
// provide mutual exclusion. Guards must not be sent, a native mutex is released by its owner.
unsafe impl lock_api::RawMutex for FastMutex {
    #[allow(clippy::declare_interior_mutable_const, reason = "required by lock_api")]
    const INIT: Self = Self::uninit();
    type GuardMarker = lock_api::GuardNoSend;

    fn lock(&self) {
        if let Err(err) = self.native_or_init().lock() {
            raise(Error::Lock(err));
        }
    }

    fn try_lock(&self) -> bool {
        self.native_or_init()
            .try_lock()
            .unwrap_or_else(|err| raise(Error::TryLock(err)))
    }

    unsafe fn unlock(&self) {
        if let Err(err) = self.native_or_init().unlock() {
            raise(Error::Unlock(err));
        }
    }
}
