// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use core::fmt;
use core::marker::PhantomData;

use crate::ManagedThread;

pub type BoxError = Box<dyn core::error::Error + Send + Sync + 'static>;

/// Why a thread's main function stopped early.
///
/// `ThreadError` deliberately does not implement [`core::error::Error`], so that every error type
/// can be turned into it with `?`.
pub enum ThreadError {
    /// The thread called [`ManagedThread::exit`]. Only the entry trampoline consumes this, as a
    /// normal completion.
    Exit,
    /// Main failed. The failure is logged and the thread terminates without exit data.
    Failed(BoxError),
}

impl ThreadError {
    pub fn failed(err: impl Into<BoxError>) -> Self {
        Self::Failed(err.into())
    }

    #[must_use]
    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Exit)
    }
}

impl<E> From<E> for ThreadError
where
    E: core::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self::Failed(Box::new(err))
    }
}

impl fmt::Debug for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exit => f.write_str("Exit"),
            Self::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
        }
    }
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exit => f.write_str("thread exited"),
            Self::Failed(err) => fmt::Display::fmt(err, f),
        }
    }
}

/// The code a [`ManagedThread`] runs.
pub trait Runnable: Send + 'static {
    /// The exit data handed to [`ManagedThread::join`].
    type Output: Send + 'static;

    /// The body of the thread. `thread` is the handle of the thread running it.
    ///
    /// # Errors
    ///
    /// Returning [`ThreadError::Exit`] (through [`ManagedThread::exit`]) ends the thread normally,
    /// any other error ends it without exit data.
    fn main(&mut self, thread: &ManagedThread<Self::Output>) -> Result<Self::Output, ThreadError>;

    /// Runs after `main` on the same thread, however it ended.
    ///
    /// # Errors
    ///
    /// Errors are logged and otherwise ignored.
    fn on_exit(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// [`Runnable`] running a closure, see [`ManagedThread::from_fn`].
pub(crate) struct FnRunnable<F, T>(pub(crate) Option<F>, pub(crate) PhantomData<fn() -> T>);

impl<F, T> Runnable for FnRunnable<F, T>
where
    F: FnOnce(&ManagedThread<T>) -> Result<T, ThreadError> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn main(&mut self, thread: &ManagedThread<T>) -> Result<T, ThreadError> {
        let f = self
            .0
            .take()
            .ok_or_else(|| ThreadError::failed("thread closure already consumed"))?;
        f(thread)
    }
}
