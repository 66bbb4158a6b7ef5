//! Scoped diagnostic modes.
//!
//! Assertion modes are per thread, matching the state they check. Each scope is an RAII value:
//! the mode is active from construction until the value is dropped, and scopes nest.
//!
//! ```rust,ignore
//! let _assert = nova_recursion::assert_on_missed_cache();
//! // any `StackStamp::may_cache_now()` returning false now panics with `CachingPrevented`
//! ```

use std::cell::Cell;
use std::marker::PhantomData;

use crate::config::RecursionConfig;

#[derive(Debug, Clone, Copy, Default)]
struct Scopes {
    missed_cache_enabled: u32,
    missed_cache_disabled: u32,
    prevention_enabled: u32,
}

thread_local! {
    static SCOPES: Cell<Scopes> = const {
        Cell::new(Scopes {
            missed_cache_enabled: 0,
            missed_cache_disabled: 0,
            prevention_enabled: 0,
        })
    };
}

fn update(f: impl FnOnce(&mut Scopes)) {
    SCOPES.with(|cell| {
        let mut scopes = cell.get();
        f(&mut scopes);
        cell.set(scopes);
    });
}

/// Whether a stamp that may not cache should panic on this thread.
///
/// A disabling scope always wins over enabling scopes and the process default.
pub(crate) fn missed_cache_assertions_active() -> bool {
    let scopes = SCOPES.with(Cell::get);
    if scopes.missed_cache_disabled > 0 {
        return false;
    }
    scopes.missed_cache_enabled > 0 || RecursionConfig::current().assert_on_missed_cache
}

pub(crate) fn prevention_assertions_active() -> bool {
    let scopes = SCOPES.with(Cell::get);
    scopes.prevention_enabled > 0 || RecursionConfig::current().assert_on_recursion_prevention
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MissedCacheMode {
    Enable,
    Disable,
}

/// Scope returned by [`assert_on_missed_cache`] and [`disable_missed_cache_assertions`].
#[must_use = "the assertion mode reverts as soon as the scope is dropped"]
#[derive(Debug)]
pub struct MissedCacheAssertions {
    mode: MissedCacheMode,
    _thread: PhantomData<*const ()>,
}

impl Drop for MissedCacheAssertions {
    fn drop(&mut self) {
        let mode = self.mode;
        update(|scopes| match mode {
            MissedCacheMode::Enable => {
                scopes.missed_cache_enabled = scopes.missed_cache_enabled.saturating_sub(1)
            }
            MissedCacheMode::Disable => {
                scopes.missed_cache_disabled = scopes.missed_cache_disabled.saturating_sub(1)
            }
        });
    }
}

/// Scope returned by [`assert_on_recursion_prevention`].
#[must_use = "the assertion mode reverts as soon as the scope is dropped"]
#[derive(Debug)]
pub struct PreventionAssertions {
    _thread: PhantomData<*const ()>,
}

impl Drop for PreventionAssertions {
    fn drop(&mut self) {
        update(|scopes| scopes.prevention_enabled = scopes.prevention_enabled.saturating_sub(1));
    }
}

/// Panic with [`crate::CachingPrevented`] whenever a [`crate::StackStamp`] on this thread reports
/// that a value may not be cached.
pub fn assert_on_missed_cache() -> MissedCacheAssertions {
    update(|scopes| scopes.missed_cache_enabled += 1);
    MissedCacheAssertions {
        mode: MissedCacheMode::Enable,
        _thread: PhantomData,
    }
}

/// Suppress missed-cache assertions on this thread, overriding [`assert_on_missed_cache`] and the
/// process default.
///
/// Meant for tests that knowingly compute values the guard will refuse to let them cache.
pub fn disable_missed_cache_assertions() -> MissedCacheAssertions {
    update(|scopes| scopes.missed_cache_disabled += 1);
    MissedCacheAssertions {
        mode: MissedCacheMode::Disable,
        _thread: PhantomData,
    }
}

/// Panic with [`crate::StackOverflowPrevented`] instead of returning `None` whenever recursion is
/// prevented on this thread.
pub fn assert_on_recursion_prevention() -> PreventionAssertions {
    update(|scopes| scopes.prevention_enabled += 1);
    PreventionAssertions {
        _thread: PhantomData,
    }
}
