// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process-wide policy for contract violations and failed native calls.
//!
//! Misusing a primitive (unlocking from the wrong thread, running a thread twice, ...) and native
//! calls that report failure are never silently swallowed. What happens next is decided here:
//!
//! - [`Policy::Abort`] logs the error and aborts the process on the spot, leaving the offending
//!   stack intact for a debugger. This is the default when `debug_assertions` are enabled.
//! - [`Policy::Error`] logs the error and hands it back to the caller as an ordinary
//!   [`Error`]. This is the default in release builds.
//!
//! The default can be overridden with the `STRAND_VIOLATION_POLICY` environment variable (`abort`
//! or `error`), read once on first use, and at any time with [`set_violation_policy`].

use core::sync::atomic::{AtomicU8, Ordering};
use std::process;

use crate::Error;

const UNSET: u8 = 0;
const ABORT: u8 = 1;
const ERROR: u8 = 2;

/// Name of the environment variable consulted on first use.
pub const POLICY_ENV: &str = "STRAND_VIOLATION_POLICY";

static POLICY: AtomicU8 = AtomicU8::new(UNSET);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Policy {
    /// Abort the process immediately.
    Abort,
    /// Return a catchable error to the caller.
    Error,
}

impl Policy {
    /// The policy used when nothing else was configured.
    #[must_use]
    pub const fn build_default() -> Self {
        if cfg!(debug_assertions) {
            Policy::Abort
        } else {
            Policy::Error
        }
    }

    const fn to_raw(self) -> u8 {
        match self {
            Policy::Abort => ABORT,
            Policy::Error => ERROR,
        }
    }
}

/// Returns the policy currently in effect.
pub fn violation_policy() -> Policy {
    let raw = match POLICY.load(Ordering::Acquire) {
        UNSET => {
            let from_env = std::env::var(POLICY_ENV).ok().and_then(|value| {
                match value.trim().to_ascii_lowercase().as_str() {
                    "abort" => Some(Policy::Abort),
                    "error" => Some(Policy::Error),
                    other => {
                        tracing::warn!(value = other, "ignoring unknown {POLICY_ENV}");
                        None
                    }
                }
            });
            let policy = from_env.unwrap_or(Policy::build_default()).to_raw();
            // An explicit `set_violation_policy` that raced with us wins.
            match POLICY.compare_exchange(UNSET, policy, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => policy,
                Err(current) => current,
            }
        }
        raw => raw,
    };

    if raw == ABORT {
        Policy::Abort
    } else {
        Policy::Error
    }
}

/// Overrides the policy for the rest of the process.
pub fn set_violation_policy(policy: Policy) {
    POLICY.store(policy.to_raw(), Ordering::Release);
}

/// Reports a violation, returning it to be propagated when the process keeps running.
#[track_caller]
pub fn report(err: Error) -> Error {
    let location = core::panic::Location::caller();
    tracing::error!(%location, error = %err, kind = ?err.kind(), "synchronization violation");
    if violation_policy() == Policy::Abort {
        process::abort();
    }
    err
}

/// Reports a violation from a context that has no way of returning an error, such as the
/// `lock_api` trait methods.
///
/// # Panics
///
/// Always panics under [`Policy::Error`], aborts under [`Policy::Abort`].
#[track_caller]
pub fn raise(err: Error) -> ! {
    let err = report(err);
    panic!("{err}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn error_policy_returns_the_error() {
        let _trace = crate::test_util::setup();
        assert_eq!(violation_policy(), Policy::Error);

        let err = report(Error::Owner("not the owner"));
        assert_eq!(err.kind(), ErrorKind::Owner);
        assert_eq!(err.to_string(), "not the owner");
    }

    #[test]
    #[should_panic(expected = "contract violation: raised")]
    fn raise_panics_under_error_policy() {
        let _trace = crate::test_util::setup();
        raise(Error::ContractViolation("raised"));
    }

    #[test]
    fn build_default_follows_debug_assertions() {
        let expected = if cfg!(debug_assertions) {
            Policy::Abort
        } else {
            Policy::Error
        };
        assert_eq!(Policy::build_default(), expected);
    }
}
