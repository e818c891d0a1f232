// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process-wide bookkeeping for managed threads: the id counter, and the references that keep
//! each running thread's shared state alive on its behalf until it is joined or detached.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::any::Any;

use strand_sync::Mutex;

use crate::ThreadId;

pub(crate) type Held = Arc<dyn Any + Send + Sync>;

struct Table {
    next_id: u64,
    held: BTreeMap<usize, Held>,
}

static TABLE: Mutex<Table> = Mutex::new(Table {
    next_id: 1,
    held: BTreeMap::new(),
});

pub(crate) fn next_id() -> ThreadId {
    let mut table = TABLE.lock();
    let id = table.next_id;
    table.next_id += 1;
    ThreadId::new(id)
}

/// Keeps `handle` alive under `key` until [`release`].
pub(crate) fn hold(key: usize, handle: Held) {
    let prev = TABLE.lock().held.insert(key, handle);
    debug_assert!(prev.is_none(), "thread {key:#x} held twice");
}

/// Drops the reference held under `key`. Returns whether there was one.
pub(crate) fn release(key: usize) -> bool {
    // The reference may be the last one, drop it after unlocking.
    let handle = TABLE.lock().held.remove(&key);
    handle.is_some()
}

pub(crate) fn is_held(key: usize) -> bool {
    TABLE.lock().held.contains_key(&key)
}

/// Number of managed threads that were started and are not yet joined, or detached and not yet
/// finished.
pub fn held_references() -> usize {
    TABLE.lock().held.len()
}
