// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Managed OS threads.
//!
//! A [`ManagedThread`] runs a [`Runnable`] on its own OS thread through a fixed entry trampoline
//! that assigns the thread its [`ThreadId`], runs `main` and `on_exit` without letting failures
//! escape, and cleans up the thread's [`ThreadLocalSlot`](strand_thread_local::ThreadLocalSlot)s
//! before the OS thread ends.

extern crate alloc;

mod id;
mod managed;
mod runnable;
mod table;

pub use id::ThreadId;
pub use managed::{ManagedThread, RunMode, RunOptions};
pub use runnable::{BoxError, Runnable, ThreadError};
pub use table::held_references;

static_assertions::assert_impl_all!(ManagedThread<alloc::string::String>: Send, Sync, Clone);

#[cfg(test)]
pub(crate) mod test_util {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    pub fn setup() -> tracing::subscriber::DefaultGuard {
        strand_sync::set_violation_policy(strand_sync::Policy::Error);
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .with_test_writer()
            .set_default()
    }
}
