// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::RefCell;
use core::convert::Infallible;
use core::fmt;
use core::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::OnceLock;

use strand_sync::{Error, Mutex, ReentrantMutex, Result, report};
use strand_thread_local::ThreadLocalSlot;

use crate::runnable::FnRunnable;
use crate::{Runnable, ThreadError, ThreadId, table};

/// How [`ManagedThread::run`] starts the thread.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum RunMode {
    /// The thread must eventually be [joined](ManagedThread::join) or
    /// [detached](ManagedThread::detach).
    #[default]
    Joinable,
    /// The thread is detached right away and cleans up after itself when it finishes.
    Detached,
}

#[derive(Debug, Copy, Clone, Default)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Native stack size in bytes, the platform default if `None`.
    pub stack_size: Option<usize>,
}

impl RunOptions {
    #[must_use]
    pub fn joinable() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn detached() -> Self {
        Self {
            mode: RunMode::Detached,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Running,
    Terminated,
}

struct State<T> {
    id: ThreadId,
    phase: Phase,
    detached: bool,
    joined: bool,
    discarded: bool,
    exit_data: Option<T>,
}

struct Inner<T: Send + 'static> {
    state: ReentrantMutex<RefCell<State<T>>>,
    body: Mutex<Option<Box<dyn Runnable<Output = T>>>>,
    native: Mutex<Option<strand_sys::Thread>>,
}

/// What the current-thread slot records about the managed thread running on an OS thread.
#[derive(Clone, Copy)]
struct Current {
    id: ThreadId,
    key: usize,
}

static CURRENT: OnceLock<ThreadLocalSlot<Current>> = OnceLock::new();

fn current_slot() -> Result<&'static ThreadLocalSlot<Current>> {
    if let Some(slot) = CURRENT.get() {
        return Ok(slot);
    }
    // Losing the race drops our slot again.
    let _ = CURRENT.set(ThreadLocalSlot::new()?);
    CURRENT
        .get()
        .ok_or_else(|| report(Error::Initialization("current thread slot missing")))
}

fn current() -> Option<Current> {
    CURRENT.get().and_then(ThreadLocalSlot::get)
}

/// A unit of execution with an explicit lifecycle.
///
/// ```text
/// NotStarted --discard()--> gone, no OS thread was ever created
/// NotStarted --run()--> Running --main returns / exit()--> Terminated
/// ```
///
/// A thread that was run must be either [joined](ManagedThread::join) exactly once, which hands
/// out its exit data, or [detached](ManagedThread::detach), after which it cleans up after
/// itself. Until then, the thread table keeps the shared state alive on the thread's behalf, so
/// it outlives the OS thread whatever happens to the handles. A thread that is neither joined
/// nor detached keeps its state alive for the rest of the process.
///
/// `ManagedThread` is a cheap handle; clones refer to the same thread.
pub struct ManagedThread<T: Send + 'static = ()> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Clone for ManagedThread<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

// === impl ManagedThread ===

impl<T: Send + 'static> ManagedThread<T> {
    pub fn new<R>(runnable: R) -> Self
    where
        R: Runnable<Output = T>,
    {
        let body: Box<dyn Runnable<Output = T>> = Box::new(runnable);
        Self {
            inner: Arc::new(Inner {
                state: ReentrantMutex::new(RefCell::new(State {
                    id: ThreadId::stub(),
                    phase: Phase::NotStarted,
                    detached: false,
                    joined: false,
                    discarded: false,
                    exit_data: None,
                })),
                body: Mutex::new(Some(body)),
                native: Mutex::new(None),
            }),
        }
    }

    /// A thread whose main function is `f`.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce(&ManagedThread<T>) -> core::result::Result<T, ThreadError> + Send + 'static,
    {
        Self::new(FnRunnable(Some(f), PhantomData))
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner).addr()
    }

    fn is_current(&self) -> bool {
        current().is_some_and(|current| current.key == self.key())
    }

    /// Starts the thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContractViolation`] if the thread was run or discarded before, and
    /// [`Error::Spawn`] if the OS refused to create the thread.
    pub fn run(&self, options: RunOptions) -> Result<()> {
        let state = self.inner.state.lock();

        let body = {
            let mut st = state.borrow_mut();
            if st.phase != Phase::NotStarted || st.discarded {
                return Err(report(Error::ContractViolation("thread run twice")));
            }
            let Some(body) = self.inner.body.lock().take() else {
                return Err(report(Error::ContractViolation("thread run twice")));
            };
            st.phase = Phase::Running;
            if options.mode == RunMode::Detached {
                st.detached = true;
            }
            body
        };

        let key = self.key();
        table::hold(key, self.inner.clone());

        let inner = self.inner.clone();
        let spawned = strand_sys::Thread::spawn(
            options.stack_size,
            Box::new(move || trampoline(ManagedThread { inner }, body)),
        );
        let native = match spawned {
            Ok(native) => native,
            Err(err) => {
                state.borrow_mut().phase = Phase::Terminated;
                table::release(key);
                return Err(report(Error::Spawn(err)));
            }
        };

        // The new thread blocks on `state` before touching any of this.
        if state.borrow().detached {
            native.detach().map_err(|err| report(Error::Spawn(err)))?;
        } else {
            *self.inner.native.lock() = Some(native);
        }
        tracing::debug!(?options, "thread started");
        Ok(())
    }

    /// Lets the thread clean up after itself once it finished, releasing the reference the
    /// thread table holds for it. Can be called before or after the thread runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContractViolation`] if the thread was already joined or detached.
    pub fn detach(&self) -> Result<()> {
        let state = self.inner.state.lock();
        let release = {
            let mut st = state.borrow_mut();
            if st.joined {
                return Err(report(Error::ContractViolation("detach of a joined thread")));
            }
            if st.detached {
                return Err(report(Error::ContractViolation("thread detached twice")));
            }
            st.detached = true;
            st.phase == Phase::Terminated
        };

        if let Some(native) = self.inner.native.lock().take() {
            native.detach().map_err(|err| report(Error::Join(err)))?;
        }
        if release {
            table::release(self.key());
        }
        tracing::debug!(id = %self.id(), release, "thread detached");
        Ok(())
    }

    /// Blocks until the thread finished and returns its exit data: the value `main` returned or
    /// passed to [`ManagedThread::exit`]. `None` if main failed or panicked.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContractViolation`] if the thread was never run, was already joined or
    /// detached, or if called by the thread itself. Returns [`Error::Join`] if the native join
    /// fails.
    pub fn join(&self) -> Result<Option<T>> {
        {
            let state = self.inner.state.lock();
            let mut st = state.borrow_mut();
            if st.phase == Phase::NotStarted {
                return Err(report(Error::ContractViolation("join of a thread that never ran")));
            }
            if st.detached {
                return Err(report(Error::ContractViolation("join of a detached thread")));
            }
            if st.joined {
                return Err(report(Error::ContractViolation("thread joined twice")));
            }
            if self.is_current() {
                return Err(report(Error::ContractViolation("thread joined itself")));
            }
            st.joined = true;
        }

        let native = self.inner.native.lock().take();
        if let Some(native) = native {
            tracing::trace!(id = %self.id(), "joining thread");
            native.join().map_err(|err| report(Error::Join(err)))?;
        }

        let exit_data = {
            let state = self.inner.state.lock();
            let mut st = state.borrow_mut();
            debug_assert_eq!(st.phase, Phase::Terminated);
            st.exit_data.take()
        };
        table::release(self.key());
        Ok(exit_data)
    }

    /// Ends the calling thread's main function with `data` as exit data.
    ///
    /// Must be called from the thread's own code. Propagate the returned error with `?` up to
    /// `main`, which ends the thread normally; all scopes on the way are dropped as usual.
    ///
    /// ```
    /// # use strand_thread::{ManagedThread, RunOptions};
    /// let thread = ManagedThread::from_fn(|this| {
    ///     this.exit(7)?;
    ///     unreachable!()
    /// });
    /// thread.run(RunOptions::joinable())?;
    /// assert_eq!(thread.join()?, Some(7));
    /// # Ok::<(), strand_sync::Error>(())
    /// ```
    ///
    /// # Errors
    ///
    /// Always returns an error: [`ThreadError::Exit`] when called by the thread itself, and
    /// [`ThreadError::Failed`] wrapping an [`Error::ContractViolation`] from any other thread.
    pub fn exit(&self, data: T) -> core::result::Result<Infallible, ThreadError> {
        if !self.is_current() {
            return Err(ThreadError::failed(report(Error::ContractViolation(
                "exit called from outside the thread",
            ))));
        }

        let state = self.inner.state.lock();
        state.borrow_mut().exit_data = Some(data);
        Err(ThreadError::Exit)
    }

    /// Destroys a thread that was never run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContractViolation`] if the thread was already run.
    pub fn discard(self) -> Result<()> {
        let body = {
            let state = self.inner.state.lock();
            let mut st = state.borrow_mut();
            if st.phase != Phase::NotStarted {
                return Err(report(Error::ContractViolation("discard of a thread that ran")));
            }
            st.discarded = true;
            self.inner.body.lock().take()
        };
        drop(body);
        tracing::trace!("thread discarded");
        Ok(())
    }

    /// The thread's id, the stub id until it started running.
    pub fn id(&self) -> ThreadId {
        self.inner.state.lock().borrow().id
    }

    /// The id of the managed thread running the caller, the stub id outside managed threads.
    pub fn current_id() -> ThreadId {
        current().map_or(ThreadId::stub(), |current| current.id)
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().borrow().phase == Phase::Running
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.state.lock().borrow().phase == Phase::Terminated
    }

    pub fn is_detached(&self) -> bool {
        self.inner.state.lock().borrow().detached
    }

    /// Whether the thread table still keeps this thread alive.
    pub fn is_held(&self) -> bool {
        table::is_held(self.key())
    }
}

impl<T: Send + 'static> fmt::Debug for ManagedThread<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        let st = state.borrow();
        f.debug_struct("ManagedThread")
            .field("id", &st.id)
            .field("phase", &st.phase)
            .field("detached", &st.detached)
            .field("joined", &st.joined)
            .finish_non_exhaustive()
    }
}

/// The entry point of every managed thread.
fn trampoline<T: Send + 'static>(this: ManagedThread<T>, mut body: Box<dyn Runnable<Output = T>>) {
    let id = crate::table::next_id();
    this.inner.state.lock().borrow_mut().id = id;
    let _span = tracing::debug_span!("managed thread", %id).entered();

    let current = Current { id, key: this.key() };
    if let Err(err) = current_slot().and_then(|slot| slot.set(current)) {
        tracing::error!(error = %err, "failed to record the current thread");
    }

    match catch_unwind(AssertUnwindSafe(|| body.main(&this))) {
        Ok(Ok(data)) => {
            this.inner.state.lock().borrow_mut().exit_data = Some(data);
            tracing::debug!("thread main returned");
        }
        Ok(Err(ThreadError::Exit)) => tracing::debug!("thread exited"),
        Ok(Err(ThreadError::Failed(err))) => tracing::error!(error = %err, "thread main failed"),
        Err(_) => tracing::error!("thread main panicked"),
    }

    match catch_unwind(AssertUnwindSafe(|| body.on_exit())) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(error = %err, "thread exit hook failed"),
        Err(_) => tracing::error!("thread exit hook panicked"),
    }
    drop(body);

    strand_thread_local::run_thread_exit();

    let release = {
        let state = this.inner.state.lock();
        let mut st = state.borrow_mut();
        st.phase = Phase::Terminated;
        st.detached
    };
    if release {
        table::release(this.key());
    }
    tracing::debug!(release, "thread terminated");
}
