// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;

pub type Result<T> = core::result::Result<T, Error>;

/// Errors reported by the synchronization primitives and managed threads.
///
/// Everything except [`Error::Capacity`] describes either API misuse or a native call that should
/// never fail, and is routed through the process-wide [violation policy](crate::Policy) before
/// it reaches the caller.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An object was used before it was initialized, or initialized twice.
    #[error("{0}")]
    Initialization(&'static str),
    /// The native object backing a primitive could not be created.
    #[error("failed to create native synchronization object")]
    NativeInit(#[source] io::Error),
    #[error("failed to lock")]
    Lock(#[source] io::Error),
    #[error("failed to unlock")]
    Unlock(#[source] io::Error),
    #[error("failed to try-lock")]
    TryLock(#[source] io::Error),
    /// The calling thread does not own the lock it tried to release.
    #[error("{0}")]
    Owner(&'static str),
    /// Posting to a semaphore would have raised its count above the maximum.
    #[error("semaphore count would exceed its maximum of {max}")]
    Capacity { max: u32 },
    /// A thread-local storage call failed.
    #[error("thread-local storage call failed")]
    Tls(#[source] io::Error),
    #[error("contract violation: {0}")]
    ContractViolation(&'static str),
    #[error("failed to spawn thread")]
    Spawn(#[source] io::Error),
    #[error("failed to join thread")]
    Join(#[source] io::Error),
}

/// Fieldless mirror of [`Error`] for matching.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    Initialization,
    Lock,
    Unlock,
    TryLock,
    Owner,
    Capacity,
    Tls,
    ContractViolation,
    Spawn,
    Join,
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Initialization(_) | Error::NativeInit(_) => ErrorKind::Initialization,
            Error::Lock(_) => ErrorKind::Lock,
            Error::Unlock(_) => ErrorKind::Unlock,
            Error::TryLock(_) => ErrorKind::TryLock,
            Error::Owner(_) => ErrorKind::Owner,
            Error::Capacity { .. } => ErrorKind::Capacity,
            Error::Tls(_) => ErrorKind::Tls,
            Error::ContractViolation(_) => ErrorKind::ContractViolation,
            Error::Spawn(_) => ErrorKind::Spawn,
            Error::Join(_) => ErrorKind::Join,
        }
    }
}
