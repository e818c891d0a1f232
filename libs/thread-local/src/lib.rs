// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread-local storage on top of native TLS keys.
//!
//! A [`ThreadLocalSlot`] holds one value per thread plus a cleanup callback for it. All slots are
//! tracked in a [`SlotRegistry`] with an explicit teardown, and each thread remembers the slots
//! it used so that it can clean them up deterministically on exit through [`run_thread_exit`],
//! instead of relying on the order in which native TLS destructors happen to run.

extern crate alloc;

mod destructors;
mod registry;
mod slot;

pub use destructors::{run as run_thread_exit, used_slots};
pub use registry::SlotRegistry;
pub use slot::ThreadLocalSlot;

static_assertions::assert_impl_all!(SlotRegistry: Send, Sync);
static_assertions::assert_impl_all!(ThreadLocalSlot<alloc::rc::Rc<u8>>: Send, Sync);

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

#[cfg(test)]
mod tests {
    use core::cell::Cell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn registry_lifecycle() {
        let _trace = test_util::setup();
        let registry: &'static SlotRegistry = Box::leak(Box::new(SlotRegistry::new()));

        let a = ThreadLocalSlot::<u32>::new_in(registry).unwrap();
        let b = ThreadLocalSlot::<u32>::new_in(registry).unwrap();
        assert_eq!(registry.live_slots(), 2);
        drop(b);
        assert_eq!(registry.live_slots(), 1);

        let runs = Rc::new(Cell::new(0));
        let r = runs.clone();
        a.set_value(1, move |_| r.set(r.get() + 1)).unwrap();

        registry.shutdown();
        assert!(registry.is_torn_down());
        assert_eq!(registry.live_slots(), 0);
        assert_eq!(runs.get(), 1);
        assert!(!a.is_set());

        // created after teardown: usable, but never registered
        let c = ThreadLocalSlot::<u32>::new_in(registry).unwrap();
        c.set(5).unwrap();
        assert_eq!(c.get(), Some(5));
        assert_eq!(registry.live_slots(), 0);

        registry.shutdown();
        drop(c);
        drop(a);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn global_registry_tracks_slots() {
        let _trace = test_util::setup();
        let slot = ThreadLocalSlot::<u32>::new().unwrap();

        assert!(!SlotRegistry::global().is_torn_down());
        assert!(SlotRegistry::global().live_slots() >= 1);
        drop(slot);
    }
}
