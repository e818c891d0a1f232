// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::time::Duration;
use std::time::Instant;

use crate::monitor::{Monitor, new_condvar};
use crate::policy::report;
use crate::{Error, Result};

struct State {
    count: u32,
    waiting: u32,
}

/// A counting semaphore with an upper bound.
///
/// [`wait`](Semaphore::wait) takes one unit, blocking while the count is zero.
/// [`post`](Semaphore::post) returns units and wakes waiters. The count never exceeds
/// [`max`](Semaphore::max).
pub struct Semaphore {
    state: Monitor<State>,
    available: strand_sys::Condvar,
    max: u32,
}

impl Semaphore {
    /// Creates a semaphore holding `initial` units out of `max`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContractViolation`] if `max` is zero or `initial` exceeds `max`, and fails
    /// if the native objects cannot be created.
    pub fn new(initial: u32, max: u32) -> Result<Self> {
        if max == 0 {
            return Err(report(Error::ContractViolation("semaphore maximum must be positive")));
        }
        if initial > max {
            return Err(report(Error::ContractViolation(
                "initial semaphore count exceeds its maximum",
            )));
        }

        Ok(Self {
            state: Monitor::new(State {
                count: initial,
                waiting: 0,
            })?,
            available: new_condvar()?,
            max,
        })
    }

    /// Takes one unit, blocking until one is available.
    ///
    /// # Errors
    ///
    /// Fails if a native call fails.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock()?;

        state.waiting += 1;
        let res = loop {
            if state.count > 0 {
                break Ok(());
            }
            if let Err(err) = state.wait(&self.available) {
                break Err(err);
            }
        };
        state.waiting -= 1;
        res?;

        state.count -= 1;
        Ok(())
    }

    /// Takes one unit, waiting at most `timeout` for one to become available.
    ///
    /// A zero `timeout` never blocks. Returns `false` if the timeout elapsed, in which case the
    /// count is unchanged.
    ///
    /// # Errors
    ///
    /// Fails if a native call fails.
    pub fn try_wait(&self, timeout: Duration) -> Result<bool> {
        let mut state = self.state.lock()?;

        if state.count > 0 {
            state.count -= 1;
            return Ok(true);
        }
        if timeout.is_zero() {
            return Ok(false);
        }

        let deadline = Instant::now().checked_add(timeout);
        state.waiting += 1;
        let res = loop {
            if state.count > 0 {
                break Ok(true);
            }
            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) if !remaining.is_zero() => remaining,
                    _ => break Ok(false),
                },
                // too far in the future to represent, wait in chunks
                None => timeout,
            };
            if let Err(err) = state.wait_timeout(&self.available, remaining) {
                break Err(err);
            }
        };
        state.waiting -= 1;

        let acquired = res?;
        if acquired {
            state.count -= 1;
        } else {
            tracing::trace!(?timeout, "semaphore wait timed out");
        }
        Ok(acquired)
    }

    /// Returns `n` units, waking waiters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capacity`] if the count would exceed [`Semaphore::max`]; the count is
    /// unchanged in that case. Exceeding the capacity is an ordinary runtime condition and not
    /// subject to the violation policy.
    pub fn post(&self, n: u32) -> Result<()> {
        if n == 0 {
            return Ok(());
        }

        let mut state = self.state.lock()?;
        let count = match state.count.checked_add(n) {
            Some(count) if count <= self.max => count,
            _ => {
                tracing::debug!(count = state.count, n, max = self.max, "semaphore post over capacity");
                return Err(Error::Capacity { max: self.max });
            }
        };
        state.count = count;

        if state.waiting > 0 {
            if n == 1 {
                self.available.notify_one();
            } else {
                self.available.notify_all();
            }
        }
        Ok(())
    }

    /// The number of units currently available.
    ///
    /// # Errors
    ///
    /// Fails if a native call fails.
    pub fn count(&self) -> Result<u32> {
        Ok(self.state.lock()?.count)
    }

    #[inline]
    pub fn max(&self) -> u32 {
        self.max
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Semaphore");
        s.field("max", &self.max);
        match self.state.lock() {
            Ok(state) => s
                .field("count", &state.count)
                .field("waiting", &state.waiting)
                .finish_non_exhaustive(),
            Err(_) => s.finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::thread;

    use super::*;
    use crate::ErrorKind;

    #[test]
    fn invalid_construction() {
        let _trace = crate::test_util::setup();

        assert_eq!(Semaphore::new(0, 0).unwrap_err().kind(), ErrorKind::ContractViolation);
        assert_eq!(Semaphore::new(3, 2).unwrap_err().kind(), ErrorKind::ContractViolation);
        assert_eq!(Semaphore::new(2, 2).unwrap().count().unwrap(), 2);
    }

    #[test]
    fn post_over_capacity() {
        let _trace = crate::test_util::setup();
        let sem = Semaphore::new(1, 2).unwrap();

        let err = sem.post(2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert_eq!(sem.count().unwrap(), 1);

        sem.post(1).unwrap();
        assert_eq!(sem.count().unwrap(), 2);
        assert_eq!(sem.post(1).unwrap_err().kind(), ErrorKind::Capacity);

        // overflow of the counter itself is a capacity error too
        assert_eq!(sem.post(u32::MAX).unwrap_err().kind(), ErrorKind::Capacity);
        assert_eq!(sem.count().unwrap(), 2);
    }

    #[test]
    fn post_zero_is_noop() {
        let _trace = crate::test_util::setup();
        let sem = Semaphore::new(1, 1).unwrap();

        sem.post(0).unwrap();
        assert_eq!(sem.count().unwrap(), 1);
    }

    #[test]
    fn post_then_wait_exhausts() {
        const N: u32 = 3;

        let _trace = crate::test_util::setup();
        let sem = Semaphore::new(0, N).unwrap();

        for _ in 0..N {
            sem.post(1).unwrap();
        }
        assert_eq!(sem.count().unwrap(), N);

        for _ in 0..N {
            sem.wait().unwrap();
        }
        assert!(!sem.try_wait(Duration::ZERO).unwrap());
        assert_eq!(sem.count().unwrap(), 0);

        assert_eq!(sem.post(N + 1).unwrap_err().kind(), ErrorKind::Capacity);
        assert_eq!(sem.count().unwrap(), 0);
    }

    #[test]
    fn try_wait_zero_timeout() {
        let _trace = crate::test_util::setup();
        let sem = Semaphore::new(0, 1).unwrap();

        assert!(!sem.try_wait(Duration::ZERO).unwrap());
        assert_eq!(sem.count().unwrap(), 0);
        sem.post(1).unwrap();
        assert!(sem.try_wait(Duration::ZERO).unwrap());
        assert_eq!(sem.count().unwrap(), 0);
    }

    #[test]
    fn try_wait_times_out() {
        let _trace = crate::test_util::setup();
        let sem = Semaphore::new(0, 1).unwrap();

        let start = Instant::now();
        assert!(!sem.try_wait(Duration::from_millis(50)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(sem.count().unwrap(), 0);
    }

    #[test]
    fn try_wait_woken_by_post() {
        let _trace = crate::test_util::setup();
        let sem = Arc::new(Semaphore::new(0, 1).unwrap());

        let waiter = thread::spawn({
            let sem = sem.clone();
            move || sem.try_wait(Duration::from_secs(10)).unwrap()
        });

        thread::sleep(Duration::from_millis(20));
        sem.post(1).unwrap();
        assert!(waiter.join().unwrap());
        assert_eq!(sem.count().unwrap(), 0);
    }

    #[test]
    fn post_many_wakes_many() {
        const WAITERS: u32 = 4;

        let _trace = crate::test_util::setup();
        let sem = Arc::new(Semaphore::new(0, WAITERS).unwrap());
        let woken = Arc::new(AtomicU32::new(0));

        let threads: Vec<_> = (0..WAITERS)
            .map(|_| {
                let sem = sem.clone();
                let woken = woken.clone();
                thread::spawn(move || {
                    sem.wait().unwrap();
                    woken.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        sem.post(WAITERS).unwrap();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), WAITERS);
        assert_eq!(sem.count().unwrap(), 0);
    }

    /// Five threads contend for two units; never more than two are inside at once.
    #[test]
    fn bounds_concurrency() {
        const UNITS: u32 = 2;

        let _trace = crate::test_util::setup();
        let sem = Arc::new(Semaphore::new(UNITS, UNITS).unwrap());
        let inside = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let passes = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..5)
            .map(|_| {
                let sem = sem.clone();
                let inside = inside.clone();
                let peak = peak.clone();
                let passes = passes.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        sem.wait().unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        passes.fetch_add(1, Ordering::SeqCst);
                        sem.post(1).unwrap();
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= UNITS);
        assert_eq!(passes.load(Ordering::SeqCst), 500);
        assert_eq!(sem.count().unwrap(), UNITS);
    }
}
