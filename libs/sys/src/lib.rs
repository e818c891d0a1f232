// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Raw bindings to the host threading system.
//!
//! Every backend exposes the same four types:
//!
//! - [`Mutex`]: a non-recursive, error-checking mutex. Relocking by the owner and unlocking by a
//!   thread that does not own the mutex are reported as errors instead of deadlocking or
//!   corrupting state.
//! - [`Condvar`]: a condition variable that waits on a [`Mutex`]. Waits may wake spuriously.
//! - [`TlsKey`]: a dynamically allocated thread-local storage key with an optional destructor.
//! - [`Thread`]: a joinable OS thread.
//!
//! All native objects live at stable heap addresses, so the wrappers can be moved freely.
//!
//! The owner tracking, counting and fairness logic built on top of these lives in
//! `strand-sync`; only the code in this crate differs per platform.

use core::ffi::c_void;

cfg_if::cfg_if! {
    if #[cfg(all(unix, not(feature = "generic")))] {
        mod unix;
        pub use unix::{Condvar, Mutex, Thread, TlsKey};
    } else {
        mod generic;
        pub use generic::{Condvar, Mutex, Thread, TlsKey};
    }
}

/// Per-thread destructor for a [`TlsKey`] value.
///
/// It is called on thread exit with the thread's non-null value, after that value has been reset
/// to null.
pub type Dtor = unsafe extern "C" fn(*mut c_void);

/// The closure type run by [`Thread::spawn`].
pub type ThreadMain = Box<dyn FnOnce() + Send + 'static>;
