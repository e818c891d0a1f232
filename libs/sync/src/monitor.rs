// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::time::Duration;

use crate::policy::report;
use crate::{Error, FastMutex, Result};

/// State guarded by one [`FastMutex`] that threads can wait on through native condition
/// variables.
pub(crate) struct Monitor<T> {
    mutex: FastMutex,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized through `mutex`
unsafe impl<T: Send> Sync for Monitor<T> {}

impl<T> Monitor<T> {
    pub(crate) fn new(data: T) -> Result<Self> {
        Ok(Self {
            mutex: FastMutex::new()?,
            data: UnsafeCell::new(data),
        })
    }

    pub(crate) fn lock(&self) -> Result<MonitorGuard<'_, T>> {
        self.mutex.lock()?;
        Ok(MonitorGuard {
            monitor: self,
            _not_send: PhantomData,
        })
    }

    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

#[clippy::has_significant_drop]
#[must_use = "if unused the Monitor will immediately unlock"]
pub(crate) struct MonitorGuard<'a, T> {
    monitor: &'a Monitor<T>,
    // The native mutex must be released by the thread that locked it.
    _not_send: PhantomData<*const ()>,
}

impl<T> MonitorGuard<'_, T> {
    /// Releases the monitor, blocks until `cv` is notified and takes the monitor again.
    pub(crate) fn wait(&mut self, cv: &strand_sys::Condvar) -> Result<()> {
        cv.wait(self.monitor.mutex.native()?)
            .map_err(|err| report(Error::Lock(err)))
    }

    /// Like [`MonitorGuard::wait`] but gives up after `dur`. Returns `true` on timeout.
    pub(crate) fn wait_timeout(&mut self, cv: &strand_sys::Condvar, dur: Duration) -> Result<bool> {
        cv.wait_timeout(self.monitor.mutex.native()?, dur)
            .map_err(|err| report(Error::Lock(err)))
    }
}

impl<T> Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves we hold the mutex
        unsafe { &*self.monitor.data.get() }
    }
}

impl<T> DerefMut for MonitorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves we hold the mutex, and `&mut self` makes the borrow unique
        unsafe { &mut *self.monitor.data.get() }
    }
}

impl<T> Drop for MonitorGuard<'_, T> {
    fn drop(&mut self) {
        // Failures were already reported by `FastMutex::unlock`.
        let _ = self.monitor.mutex.unlock();
    }
}

pub(crate) fn new_condvar() -> Result<strand_sys::Condvar> {
    strand_sys::Condvar::new().map_err(|err| report(Error::NativeInit(err)))
}
