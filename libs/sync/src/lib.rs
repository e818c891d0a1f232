// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization primitives over the native threading facilities of the host.
//!
//! - [`FastMutex`]: one native mutex, no recursion
//! - [`RecursiveMutex`]: re-lockable by its owner
//! - [`RwLock`]: shared/exclusive lock with optional writer preference
//! - [`Semaphore`]: bounded counting semaphore
//!
//! Misuse is reported according to the process-wide [`Policy`].

mod error;
mod fast_mutex;
mod monitor;
mod policy;
mod reentrant_mutex;
mod rw_lock;
mod semaphore;

pub use error::{Error, ErrorKind, Result};
pub use fast_mutex::{FastMutex, Mutex, MutexGuard};
pub use policy::{POLICY_ENV, Policy, raise, report, set_violation_policy, violation_policy};
pub use reentrant_mutex::{
    CurrentThreadId, RecursiveMutex, ReentrantMutex, ReentrantMutexGuard, current_thread_id,
};
pub use rw_lock::{RwLock, RwLockFlags, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::Semaphore;

static_assertions::assert_impl_all!(FastMutex: Send, Sync);
static_assertions::assert_impl_all!(RecursiveMutex: Send, Sync);
static_assertions::assert_impl_all!(RwLock: Send, Sync);
static_assertions::assert_impl_all!(Semaphore: Send, Sync);
static_assertions::assert_not_impl_any!(RwLockReadGuard<'static>: Send);
static_assertions::assert_not_impl_any!(RwLockWriteGuard<'static>: Send);

#[cfg(test)]
pub(crate) mod test_util {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    /// Switches violations to returned errors and routes logs of the calling thread to the test
    /// output.
    pub fn setup() -> tracing::subscriber::DefaultGuard {
        crate::set_violation_policy(crate::Policy::Error);
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .with_test_writer()
            .set_default()
    }
}
