// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! pthread backend.

use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::mem::{self, MaybeUninit};
use core::ptr;
use core::time::Duration;
use std::io;

use crate::{Dtor, ThreadMain};

// Condition variables on Apple platforms cannot be switched to the monotonic clock.
#[cfg(not(target_vendor = "apple"))]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
#[cfg(target_vendor = "apple")]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

#[inline]
fn cvt(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(ret))
    }
}

// === impl Mutex ===

pub struct Mutex {
    inner: Box<UnsafeCell<libc::pthread_mutex_t>>,
}

// Safety: pthread mutexes are made to be shared between threads, and the boxed storage never moves
unsafe impl Send for Mutex {}
// Safety: see above
unsafe impl Sync for Mutex {}

impl Mutex {
    /// Creates a new error-checking mutex.
    ///
    /// # Errors
    ///
    /// Returns the error reported by `pthread_mutex_init`.
    pub fn new() -> io::Result<Self> {
        let inner = Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();

        // Safety: `attr` is initialized by `pthread_mutexattr_init` before anything else reads it,
        // and destroyed exactly once. `inner` points to boxed, not yet initialized mutex storage.
        unsafe {
            cvt(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            let res = cvt(libc::pthread_mutexattr_settype(
                attr.as_mut_ptr(),
                libc::PTHREAD_MUTEX_ERRORCHECK,
            ))
            .and_then(|()| cvt(libc::pthread_mutex_init(inner.get(), attr.as_ptr())));
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            res?;
        }

        Ok(Self { inner })
    }

    #[inline]
    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.inner.get()
    }

    /// # Errors
    ///
    /// Reports `EDEADLK` if the calling thread already holds the mutex.
    pub fn lock(&self) -> io::Result<()> {
        // Safety: the mutex was initialized in `new` and lives until `drop`
        cvt(unsafe { libc::pthread_mutex_lock(self.raw()) })
    }

    /// # Errors
    ///
    /// Returns any error other than `EBUSY` reported by `pthread_mutex_trylock`.
    pub fn try_lock(&self) -> io::Result<bool> {
        // Safety: the mutex was initialized in `new` and lives until `drop`
        match unsafe { libc::pthread_mutex_trylock(self.raw()) } {
            0 => Ok(true),
            libc::EBUSY => Ok(false),
            err => Err(io::Error::from_raw_os_error(err)),
        }
    }

    /// # Errors
    ///
    /// Reports `EPERM` if the calling thread does not hold the mutex.
    pub fn unlock(&self) -> io::Result<()> {
        // Safety: the mutex was initialized in `new`; error-checking mutexes reject foreign unlocks
        cvt(unsafe { libc::pthread_mutex_unlock(self.raw()) })
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        if matches!(self.try_lock(), Ok(true)) {
            // Safety: we hold the lock, so no other thread can be using the mutex
            unsafe {
                libc::pthread_mutex_unlock(self.raw());
                libc::pthread_mutex_destroy(self.raw());
            }
        } else {
            // Destroying a locked pthread mutex is undefined behaviour, leak it instead. The
            // replacement was statically initialized and needs no destroy call.
            let locked = mem::replace(
                &mut self.inner,
                Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER)),
            );
            mem::forget(locked);
        }
    }
}

// === impl Condvar ===

pub struct Condvar {
    inner: Box<UnsafeCell<libc::pthread_cond_t>>,
}

// Safety: pthread condition variables are made to be shared between threads
unsafe impl Send for Condvar {}
// Safety: see above
unsafe impl Sync for Condvar {}

impl Condvar {
    /// # Errors
    ///
    /// Returns the error reported by `pthread_cond_init`.
    pub fn new() -> io::Result<Self> {
        let inner = Box::new(UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER));
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();

        // Safety: `attr` is initialized before use and destroyed exactly once
        unsafe {
            cvt(libc::pthread_condattr_init(attr.as_mut_ptr()))?;
            #[cfg(not(target_vendor = "apple"))]
            let res = cvt(libc::pthread_condattr_setclock(attr.as_mut_ptr(), WAIT_CLOCK))
                .and_then(|()| cvt(libc::pthread_cond_init(inner.get(), attr.as_ptr())));
            #[cfg(target_vendor = "apple")]
            let res = cvt(libc::pthread_cond_init(inner.get(), attr.as_ptr()));
            libc::pthread_condattr_destroy(attr.as_mut_ptr());
            res?;
        }

        Ok(Self { inner })
    }

    #[inline]
    fn raw(&self) -> *mut libc::pthread_cond_t {
        self.inner.get()
    }

    /// Atomically releases `mutex` and blocks until notified, then reacquires `mutex`.
    ///
    /// # Errors
    ///
    /// Returns the error reported by `pthread_cond_wait`, e.g. `EPERM` when `mutex` is not held.
    pub fn wait(&self, mutex: &Mutex) -> io::Result<()> {
        // Safety: both objects were initialized by their constructors
        cvt(unsafe { libc::pthread_cond_wait(self.raw(), mutex.raw()) })
    }

    /// Like [`Condvar::wait`] but gives up after `dur`. Returns `true` if the wait timed out.
    ///
    /// # Errors
    ///
    /// Returns any error other than `ETIMEDOUT` reported by `pthread_cond_timedwait`.
    pub fn wait_timeout(&self, mutex: &Mutex, dur: Duration) -> io::Result<bool> {
        let deadline = deadline_after(dur)?;

        // Safety: both objects were initialized by their constructors, `deadline` is a valid
        // timespec on the stack
        match unsafe { libc::pthread_cond_timedwait(self.raw(), mutex.raw(), &raw const deadline) } {
            0 => Ok(false),
            libc::ETIMEDOUT => Ok(true),
            err => Err(io::Error::from_raw_os_error(err)),
        }
    }

    pub fn notify_one(&self) {
        // Safety: the condvar was initialized in `new`
        unsafe {
            libc::pthread_cond_signal(self.raw());
        }
    }

    pub fn notify_all(&self) {
        // Safety: the condvar was initialized in `new`
        unsafe {
            libc::pthread_cond_broadcast(self.raw());
        }
    }
}

impl Drop for Condvar {
    fn drop(&mut self) {
        // Safety: we have exclusive access, so nobody is waiting on the condvar
        unsafe {
            libc::pthread_cond_destroy(self.raw());
        }
    }
}

fn deadline_after(dur: Duration) -> io::Result<libc::timespec> {
    const NANOS_PER_SEC: i64 = 1_000_000_000;

    let mut now = MaybeUninit::<libc::timespec>::uninit();
    // Safety: `clock_gettime` fully initializes `now` on success
    let mut ts = unsafe {
        if libc::clock_gettime(WAIT_CLOCK, now.as_mut_ptr()) != 0 {
            return Err(io::Error::last_os_error());
        }
        now.assume_init()
    };

    let mut nsec = i64::from(ts.tv_nsec) + i64::from(dur.subsec_nanos());
    let mut carry = 0;
    if nsec >= NANOS_PER_SEC {
        nsec -= NANOS_PER_SEC;
        carry = 1;
    }

    let secs = libc::time_t::try_from(dur.as_secs())
        .ok()
        .and_then(|secs| ts.tv_sec.checked_add(secs))
        .and_then(|secs| secs.checked_add(carry));

    match secs {
        Some(secs) => {
            ts.tv_sec = secs;
            ts.tv_nsec = libc::c_long::try_from(nsec).unwrap_or(0);
        }
        // The deadline is beyond what the clock can represent; wait "forever".
        None => {
            ts.tv_sec = libc::time_t::MAX;
            ts.tv_nsec = 0;
        }
    }

    Ok(ts)
}

// === impl TlsKey ===

pub struct TlsKey {
    key: libc::pthread_key_t,
}

impl TlsKey {
    /// # Errors
    ///
    /// Returns the error reported by `pthread_key_create`, typically `EAGAIN` once the process ran
    /// out of keys.
    pub fn new(dtor: Option<Dtor>) -> io::Result<Self> {
        let mut key = MaybeUninit::<libc::pthread_key_t>::uninit();
        // Safety: `pthread_key_create` initializes `key` on success
        unsafe {
            cvt(libc::pthread_key_create(key.as_mut_ptr(), dtor))?;
            Ok(Self {
                key: key.assume_init(),
            })
        }
    }

    /// Returns the calling thread's value, null if it never set one.
    #[inline]
    pub fn get(&self) -> *mut u8 {
        // Safety: the key is valid until `drop`
        unsafe { libc::pthread_getspecific(self.key).cast() }
    }

    /// # Errors
    ///
    /// Returns the error reported by `pthread_setspecific`.
    #[inline]
    pub fn set(&self, value: *mut u8) -> io::Result<()> {
        // Safety: the key is valid until `drop`
        cvt(unsafe { libc::pthread_setspecific(self.key, value.cast_const().cast()) })
    }
}

impl Drop for TlsKey {
    fn drop(&mut self) {
        // Safety: the key is valid and is not used again
        unsafe {
            libc::pthread_key_delete(self.key);
        }
    }
}

// === impl Thread ===

pub struct Thread {
    id: libc::pthread_t,
}

impl Thread {
    /// Spawns a new OS thread running `main`.
    ///
    /// # Errors
    ///
    /// Returns the error reported by `pthread_create`, in which case `main` is dropped without
    /// being run.
    pub fn spawn(stack_size: Option<usize>, main: ThreadMain) -> io::Result<Thread> {
        let payload = Box::into_raw(Box::new(main));
        let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
        let mut id = MaybeUninit::<libc::pthread_t>::uninit();

        // Safety: `attr` is initialized before use and destroyed exactly once. Ownership of
        // `payload` passes to the new thread on success and is reclaimed here on failure.
        unsafe {
            if let Err(err) = cvt(libc::pthread_attr_init(attr.as_mut_ptr())) {
                drop(Box::from_raw(payload));
                return Err(err);
            }

            let mut res = Ok(());
            if let Some(size) = stack_size {
                res = cvt(libc::pthread_attr_setstacksize(
                    attr.as_mut_ptr(),
                    size.max(libc::PTHREAD_STACK_MIN),
                ));
            }
            if res.is_ok() {
                res = cvt(libc::pthread_create(
                    id.as_mut_ptr(),
                    attr.as_ptr(),
                    thread_start,
                    payload.cast(),
                ));
            }
            libc::pthread_attr_destroy(attr.as_mut_ptr());

            match res {
                Ok(()) => Ok(Thread {
                    id: id.assume_init(),
                }),
                Err(err) => {
                    drop(Box::from_raw(payload));
                    Err(err)
                }
            }
        }
    }

    /// Blocks until the thread has finished.
    ///
    /// # Errors
    ///
    /// Returns the error reported by `pthread_join`, e.g. `EDEADLK` when joining the calling
    /// thread itself.
    pub fn join(self) -> io::Result<()> {
        // Safety: the thread is joinable; `self` is consumed so it is joined at most once
        cvt(unsafe { libc::pthread_join(self.id, ptr::null_mut()) })
    }

    /// Lets the thread release its resources on its own once it finishes.
    ///
    /// # Errors
    ///
    /// Returns the error reported by `pthread_detach`.
    pub fn detach(self) -> io::Result<()> {
        // Safety: the thread is joinable; `self` is consumed so it is detached at most once
        cvt(unsafe { libc::pthread_detach(self.id) })
    }
}

extern "C" fn thread_start(payload: *mut c_void) -> *mut c_void {
    // Safety: `payload` came from `Box::into_raw` in `Thread::spawn` and is consumed exactly once
    let main = unsafe { Box::from_raw(payload.cast::<ThreadMain>()) };
    main();
    ptr::null_mut()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn mutex_is_error_checking() {
        let m = Mutex::new().unwrap();

        m.lock().unwrap();
        assert_eq!(m.lock().unwrap_err().raw_os_error(), Some(libc::EDEADLK));
        assert!(!m.try_lock().unwrap());
        m.unlock().unwrap();
        assert_eq!(m.unlock().unwrap_err().raw_os_error(), Some(libc::EPERM));
    }

    #[test]
    fn dropping_locked_mutex_leaks() {
        let m = Mutex::new().unwrap();
        m.lock().unwrap();
        drop(m);
    }

    #[test]
    fn condvar_times_out() {
        let m = Mutex::new().unwrap();
        let cv = Condvar::new().unwrap();

        m.lock().unwrap();
        assert!(cv.wait_timeout(&m, Duration::from_millis(10)).unwrap());
        m.unlock().unwrap();
    }

    #[test]
    fn thread_runs_and_joins() {
        let hits = Arc::new(AtomicUsize::new(0));
        let t = Thread::spawn(Some(64 * 1024), {
            let hits = hits.clone();
            Box::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        })
        .unwrap();

        t.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
