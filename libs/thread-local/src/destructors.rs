// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The slots used by the current thread, for forced cleanup on thread exit.
//!
//! Native TLS destructors run in an unspecified order relative to each other and to the rest of
//! the thread teardown, and not at all on some platforms for some threads. Threads that care
//! call [`run`] as the last thing before returning to the OS.

use alloc::sync::Weak;
use alloc::vec::Vec;
use core::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::slot::ErasedSlot;

std::thread_local! {
    static USED: RefCell<Vec<(u64, Weak<dyn ErasedSlot>)>> = const { RefCell::new(Vec::new()) };
}

/// Remembers that the current thread stored a value in `slot`.
pub(crate) fn register(id: u64, slot: Weak<dyn ErasedSlot>) {
    // The list is already gone while the thread's storage is destroyed; the native destructor
    // takes care of the value then.
    let _ = USED.try_with(|used| {
        let Ok(mut used) = used.try_borrow_mut() else {
            tracing::warn!(id, "slot used while thread-exit cleanup is running");
            return;
        };
        if !used.iter().any(|(used_id, _)| *used_id == id) {
            used.push((id, slot));
        }
    });
}

/// Resets the current thread's value of every slot it used, running the cleanups.
///
/// Slots first used by a cleanup are cleaned up as well. Slots that were dropped in the meantime
/// are skipped. A cleanup that fails or panics is logged and the remaining slots are still
/// cleaned up.
pub fn run() {
    loop {
        let next = USED
            .try_with(|used| used.borrow_mut().pop())
            .ok()
            .flatten();
        let Some((id, slot)) = next else {
            // Free the list memory.
            let _ = USED.try_with(|used| *used.borrow_mut() = Vec::new());
            break;
        };

        if let Some(slot) = slot.upgrade() {
            tracing::trace!(id, "running thread-exit cleanup");
            // The cell is detached from the key before the cleanup runs, so unwinding out of it
            // leaves nothing half-released.
            match catch_unwind(AssertUnwindSafe(|| slot.reset_current())) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::error!(id, error = %err, "thread-exit cleanup failed"),
                Err(_) => tracing::error!(id, "thread-exit cleanup panicked"),
            }
        }
    }
}

/// Number of slots the current thread stored a value in since the last [`run`].
pub fn used_slots() -> usize {
    USED.try_with(|used| used.borrow().len()).unwrap_or(0)
}
