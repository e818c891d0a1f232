// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::cell::RefCell;
use core::ffi::c_void;
use core::fmt;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};
use std::panic::{AssertUnwindSafe, catch_unwind};

use strand_sync::{Error, Result, report};

use crate::{SlotRegistry, destructors};

type Cleanup<T> = Box<dyn FnOnce(T)>;

/// The value a thread stored in a slot, together with the cleanup to run on it.
struct Entry<T> {
    value: T,
    cleanup: Option<Cleanup<T>>,
}

impl<T> Entry<T> {
    fn finish(self) {
        match self.cleanup {
            Some(cleanup) => cleanup(self.value),
            None => drop(self.value),
        }
    }
}

/// The per-thread cell a native key points to.
type Cell<T> = RefCell<Option<Entry<T>>>;

/// Type-erased view of a slot, as seen by the registry and the thread-exit cleanup.
pub(crate) trait ErasedSlot: Send + Sync {
    fn id(&self) -> u64;
    /// Releases the calling thread's cell, running the cleanup of its value.
    fn reset_current(&self) -> Result<()>;
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct Shared<T: 'static> {
    id: u64,
    key: strand_sys::TlsKey,
    // Values of `T` never leave the thread that stored them.
    _marker: PhantomData<fn(T)>,
}

impl<T: 'static> Shared<T> {
    fn cell(&self) -> Option<&Cell<T>> {
        let ptr = self.key.get().cast::<Cell<T>>();
        // Safety: non-null values of `key` are `Box<Cell<T>>` pointers created by the calling
        // thread. They are only freed by the calling thread, after the key was reset to null.
        unsafe { ptr.as_ref() }
    }
}

impl<T: 'static> ErasedSlot for Shared<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn reset_current(&self) -> Result<()> {
        let ptr = self.key.get().cast::<Cell<T>>();
        if ptr.is_null() {
            return Ok(());
        }

        // Safety: see `Shared::cell`
        let cell = unsafe { &*ptr };
        if cell.try_borrow_mut().is_err() {
            return Err(report(Error::ContractViolation(
                "thread-local slot released while its value is borrowed",
            )));
        }
        self.key
            .set(ptr::null_mut())
            .map_err(|err| report(Error::Tls(err)))?;

        // Safety: `ptr` came from `Box::into_raw`, is no longer reachable through the key and
        // nothing borrows the cell
        let cell = unsafe { Box::from_raw(ptr) };
        if let Some(entry) = cell.into_inner() {
            entry.finish();
        }
        Ok(())
    }
}

impl<T: 'static> Drop for Shared<T> {
    fn drop(&mut self) {
        tracing::trace!(id = self.id, "deleting thread-local key");
    }
}

/// Native destructor of a slot's per-thread cell, run on thread exit by threads that did not
/// clean up their slots themselves.
unsafe extern "C" fn destroy_cell<T: 'static>(ptr: *mut c_void) {
    // Safety: the native key only ever holds pointers from `Box::into_raw` and resets the value
    // to null before calling us
    let cell = unsafe { Box::from_raw(ptr.cast::<Cell<T>>()) };
    let Some(entry) = cell.into_inner() else {
        return;
    };
    if catch_unwind(AssertUnwindSafe(|| entry.finish())).is_err() {
        tracing::error!("thread-local cleanup panicked during thread exit");
    }
}

/// A value per thread, with a cleanup callback that runs exactly once per stored value.
///
/// The cleanup of a value runs on whichever comes first:
///
/// - the value is replaced with [`set_value`](ThreadLocalSlot::set_value)
/// - the value is removed with [`reset`](ThreadLocalSlot::reset), or the slot is dropped (for the
///   dropping thread only)
/// - the owning thread exits
///
/// Every thread sees its own value; a thread that never stored one sees nothing. Values of other
/// threads still stored when the slot is dropped are leaked without running their cleanup.
///
/// # Examples
///
/// ```
/// use strand_thread_local::ThreadLocalSlot;
///
/// let slot = ThreadLocalSlot::new()?;
/// slot.set_value(String::from("hello"), |s| println!("cleaning up {s}"))?;
/// assert_eq!(slot.get().as_deref(), Some("hello"));
/// # Ok::<(), strand_sync::Error>(())
/// ```
pub struct ThreadLocalSlot<T: 'static> {
    shared: Arc<Shared<T>>,
    registry: &'static SlotRegistry,
    registered: bool,
}

impl<T: 'static> ThreadLocalSlot<T> {
    /// Creates a slot registered in the [global registry](SlotRegistry::global).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NativeInit`] when no native key can be allocated.
    pub fn new() -> Result<Self> {
        Self::new_in(SlotRegistry::global())
    }

    /// Creates a slot registered in `registry`, unless the registry is already torn down.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NativeInit`] when no native key can be allocated.
    pub fn new_in(registry: &'static SlotRegistry) -> Result<Self> {
        let key = strand_sys::TlsKey::new(Some(destroy_cell::<T>))
            .map_err(|err| report(Error::NativeInit(err)))?;
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared {
            id,
            key,
            _marker: PhantomData,
        });

        let weak: Weak<Shared<T>> = Arc::downgrade(&shared);
        let erased: Weak<dyn ErasedSlot> = weak;
        let registered = registry.register(id, erased);
        tracing::trace!(id, registered, "created thread-local slot");

        Ok(Self {
            shared,
            registry,
            registered,
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    fn cell_or_init(&self) -> Result<&Cell<T>> {
        if let Some(cell) = self.shared.cell() {
            return Ok(cell);
        }

        let cell = Box::into_raw(Box::new(Cell::<T>::new(None)));
        if let Err(err) = self.shared.key.set(cell.cast()) {
            // Safety: `cell` was never published
            drop(unsafe { Box::from_raw(cell) });
            return Err(report(Error::Tls(err)));
        }
        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        let erased: Weak<dyn ErasedSlot> = weak;
        destructors::register(self.shared.id, erased);

        // Safety: just stored in the key, see `Shared::cell`
        Ok(unsafe { &*cell })
    }

    fn replace(&self, entry: Entry<T>) -> Result<()> {
        let cell = self.cell_or_init()?;
        let old = {
            let Ok(mut current) = cell.try_borrow_mut() else {
                return Err(report(Error::ContractViolation(
                    "thread-local slot set while its value is borrowed",
                )));
            };
            current.replace(entry)
        };

        // Runs with the new value in place, so the cleanup observes the slot's new state.
        if let Some(old) = old {
            tracing::trace!(id = self.shared.id, "replacing thread-local value");
            old.finish();
        }
        Ok(())
    }

    /// Stores `value` for the calling thread, running the cleanup of the value it replaces.
    /// `cleanup` runs once on `value` when it is replaced, reset or its thread exits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContractViolation`] when called from within [`ThreadLocalSlot::with`]
    /// and [`Error::Tls`] if the native key cannot be set.
    pub fn set_value<F>(&self, value: T, cleanup: F) -> Result<()>
    where
        F: FnOnce(T) + 'static,
    {
        self.replace(Entry {
            value,
            cleanup: Some(Box::new(cleanup)),
        })
    }

    /// Stores `value` for the calling thread. It is dropped when replaced, reset or its thread
    /// exits.
    ///
    /// # Errors
    ///
    /// See [`ThreadLocalSlot::set_value`].
    pub fn set(&self, value: T) -> Result<()> {
        self.replace(Entry {
            value,
            cleanup: None,
        })
    }

    /// Calls `f` with the calling thread's value.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(Option<&T>) -> R,
    {
        match self.shared.cell().map(RefCell::try_borrow) {
            Some(Ok(entry)) => f(entry.as_ref().map(|entry| &entry.value)),
            _ => f(None),
        }
    }

    pub fn is_set(&self) -> bool {
        self.with(|value| value.is_some())
    }

    /// Removes the calling thread's value and runs its cleanup. Does nothing if there is no
    /// value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContractViolation`] when called from within [`ThreadLocalSlot::with`].
    pub fn reset(&self) -> Result<()> {
        let Some(cell) = self.shared.cell() else {
            return Ok(());
        };
        let old = {
            let Ok(mut current) = cell.try_borrow_mut() else {
                return Err(report(Error::ContractViolation(
                    "thread-local slot reset while its value is borrowed",
                )));
            };
            current.take()
        };

        if let Some(old) = old {
            old.finish();
        }
        Ok(())
    }
}

impl<T: Clone + 'static> ThreadLocalSlot<T> {
    /// Returns a copy of the calling thread's value.
    pub fn get(&self) -> Option<T> {
        self.with(|value| value.cloned())
    }
}

impl<T: 'static> Drop for ThreadLocalSlot<T> {
    fn drop(&mut self) {
        // Errors were reported already.
        let _ = self.shared.reset_current();
        if self.registered {
            self.registry.unregister(self.shared.id);
        }
    }
}

impl<T: 'static> fmt::Debug for ThreadLocalSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocalSlot")
            .field("id", &self.shared.id)
            .field("registered", &self.registered)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::cell::Cell as StdCell;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};
    use std::thread;

    use strand_sync::ErrorKind;

    use super::*;

    #[test]
    fn values_are_per_thread() {
        let _trace = crate::test_util::setup();
        let slot = Arc::new(ThreadLocalSlot::<u32>::new().unwrap());

        slot.set(1).unwrap();
        thread::spawn({
            let slot = slot.clone();
            move || {
                assert_eq!(slot.get(), None);
                slot.set(2).unwrap();
                assert_eq!(slot.get(), Some(2));
            }
        })
        .join()
        .unwrap();

        assert_eq!(slot.get(), Some(1));
    }

    #[test]
    fn cleanup_on_overwrite_and_reset() {
        let _trace = crate::test_util::setup();
        let slot = ThreadLocalSlot::<u32>::new().unwrap();
        let cleaned = Rc::new(RefCell::new(Vec::new()));

        let log = cleaned.clone();
        slot.set_value(1, move |v| log.borrow_mut().push(v)).unwrap();
        let log = cleaned.clone();
        slot.set_value(2, move |v| log.borrow_mut().push(v)).unwrap();
        assert_eq!(*cleaned.borrow(), [1]);

        slot.reset().unwrap();
        assert_eq!(*cleaned.borrow(), [1, 2]);
        assert!(!slot.is_set());

        // nothing left to clean up
        slot.reset().unwrap();
        drop(slot);
        assert_eq!(*cleaned.borrow(), [1, 2]);
    }

    #[test]
    fn cleanup_on_drop() {
        let _trace = crate::test_util::setup();
        let slot = ThreadLocalSlot::<u32>::new().unwrap();
        let runs = Rc::new(StdCell::new(0));

        let r = runs.clone();
        slot.set_value(7, move |_| r.set(r.get() + 1)).unwrap();
        drop(slot);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn cleanup_on_native_thread_exit() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);

        let _trace = crate::test_util::setup();
        let slot = Arc::new(ThreadLocalSlot::<u32>::new().unwrap());

        thread::spawn({
            let slot = slot.clone();
            move || {
                slot.set_value(3, |v| {
                    assert_eq!(v, 3);
                    RUNS.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        })
        .join()
        .unwrap();

        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn forced_exit_cleanup_runs_once() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);

        let _trace = crate::test_util::setup();
        let slot = Arc::new(ThreadLocalSlot::<u32>::new().unwrap());

        thread::spawn({
            let slot = slot.clone();
            move || {
                slot.set_value(3, |_| {
                    RUNS.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
                assert_eq!(destructors::used_slots(), 1);

                destructors::run();
                assert_eq!(RUNS.load(Ordering::SeqCst), 1);
                assert!(!slot.is_set());
                assert_eq!(destructors::used_slots(), 0);
            }
        })
        .join()
        .unwrap();

        // the native destructor found nothing left to do
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn forced_exit_cleanup_survives_panics() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);

        let _trace = crate::test_util::setup();
        let panicking = Arc::new(ThreadLocalSlot::<u32>::new().unwrap());
        let counted = Arc::new(ThreadLocalSlot::<u32>::new().unwrap());

        thread::spawn({
            let panicking = panicking.clone();
            let counted = counted.clone();
            move || {
                counted
                    .set_value(1, |_| {
                        RUNS.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
                panicking.set_value(2, |_| panic!("cleanup failed")).unwrap();
                assert_eq!(destructors::used_slots(), 2);

                destructors::run();
                assert_eq!(RUNS.load(Ordering::SeqCst), 1);
                assert!(!panicking.is_set());
                assert!(!counted.is_set());
                assert_eq!(destructors::used_slots(), 0);
            }
        })
        .join()
        .unwrap();

        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanup_may_use_the_slot() {
        let _trace = crate::test_util::setup();
        let slot = Rc::new(ThreadLocalSlot::<u32>::new().unwrap());
        let seen = Rc::new(StdCell::new(None));

        let s = slot.clone();
        let seen2 = seen.clone();
        slot.set_value(1, move |_| seen2.set(s.get())).unwrap();
        slot.set(2).unwrap();
        assert_eq!(seen.get(), Some(2));

        slot.reset().unwrap();
    }

    #[test]
    fn set_inside_with_is_rejected() {
        let _trace = crate::test_util::setup();
        let slot = ThreadLocalSlot::<u32>::new().unwrap();

        slot.set(1).unwrap();
        let kind = slot.with(|value| {
            assert_eq!(value, Some(&1));
            slot.set(2).unwrap_err().kind()
        });
        assert_eq!(kind, ErrorKind::ContractViolation);
        assert_eq!(slot.get(), Some(1));
    }

    #[test]
    fn non_send_values() {
        let _trace = crate::test_util::setup();
        let slot = ThreadLocalSlot::<Rc<Mutex<u32>>>::new().unwrap();
        let value = Rc::new(Mutex::new(5));

        slot.set(value.clone()).unwrap();
        assert_eq!(Rc::strong_count(&value), 2);
        slot.reset().unwrap();
        assert_eq!(Rc::strong_count(&value), 1);
    }
}
