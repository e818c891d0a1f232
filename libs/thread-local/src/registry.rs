// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::collections::BTreeMap;
use alloc::sync::Weak;
use alloc::vec::Vec;
use core::fmt;

use strand_sync::Mutex;

use crate::slot::ErasedSlot;

/// The set of all live slots created against it.
///
/// Slots register themselves on creation and unregister when dropped. Once
/// [`shutdown`](SlotRegistry::shutdown) ran, the registry is closed: new slots are no longer
/// registered, and dropping a slot no longer touches the registry.
pub struct SlotRegistry {
    inner: Mutex<Inner>,
}

struct Inner {
    slots: BTreeMap<u64, Weak<dyn ErasedSlot>>,
    torn_down: bool,
}

static GLOBAL: SlotRegistry = SlotRegistry::new();

impl SlotRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: BTreeMap::new(),
                torn_down: false,
            }),
        }
    }

    /// The process-wide registry used by [`ThreadLocalSlot::new`](crate::ThreadLocalSlot::new).
    #[inline]
    pub fn global() -> &'static SlotRegistry {
        &GLOBAL
    }

    /// Registers `slot` under `id` unless the registry is torn down. Returns whether the slot was
    /// registered.
    pub(crate) fn register(&self, id: u64, slot: Weak<dyn ErasedSlot>) -> bool {
        let mut inner = self.inner.lock();
        if inner.torn_down {
            tracing::trace!(id, "registry torn down, slot left unregistered");
            return false;
        }
        inner.slots.insert(id, slot);
        true
    }

    pub(crate) fn unregister(&self, id: u64) {
        let mut inner = self.inner.lock();
        if !inner.torn_down {
            inner.slots.remove(&id);
        }
    }

    /// Closes the registry, then resets the calling thread's value of every slot that was still
    /// registered, running its cleanup.
    ///
    /// Values held by other threads are left to their thread's exit cleanup. Calling `shutdown`
    /// again is a no-op.
    pub fn shutdown(&self) {
        let slots: Vec<_> = {
            let mut inner = self.inner.lock();
            if inner.torn_down {
                return;
            }
            inner.torn_down = true;
            core::mem::take(&mut inner.slots)
                .into_values()
                .filter_map(|slot| slot.upgrade())
                .collect()
        };

        tracing::debug!(slots = slots.len(), "shutting down slot registry");
        for slot in slots {
            if let Err(err) = slot.reset_current() {
                tracing::warn!(id = slot.id(), error = %err, "failed to reset slot during shutdown");
            }
        }
    }

    /// Number of slots currently registered.
    pub fn live_slots(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.lock().torn_down
    }
}

impl Default for SlotRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SlotRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SlotRegistry")
            .field("live_slots", &inner.slots.len())
            .field("torn_down", &inner.torn_down)
            .finish_non_exhaustive()
    }
}
