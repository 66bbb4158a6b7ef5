//! Recursion guard for Nova's analyses.
//!
//! Semantic queries routinely recurse into themselves through code they do not control: resolving
//! a supertype asks for the supertypes of its own outer class, inferring a field type reads an
//! initializer that mentions the field again. This crate keeps such computations finite:
//!
//! - [`RecursionGuard::do_preventing_recursion`] runs a computation unless an equal key is already
//!   being computed on the calling thread, in which case it returns `None` right away.
//! - Whenever that happens, every computation between the two calls is *tainted*: its result was
//!   built from an incomplete answer. [`mark_stack`] / [`StackStamp::may_cache_now`] let callers
//!   check this before putting a value in a long-lived cache.
//! - Results can be memoized for the rest of the outermost computation, so that a cycle is not
//!   re-explored over and over. Tainted results are only reused while the frames they depend on
//!   are still active.
//!
//! The calculation stack is thread-local. A chain of guarded calls has to stay on one thread for
//! its recursion to be detected.
//!
//! Diagnostics are opt-in: [`assert_on_missed_cache`] turns a `false` from
//! [`StackStamp::may_cache_now`] into a [`CachingPrevented`] panic, and
//! [`assert_on_recursion_prevention`] turns every prevented call into a
//! [`StackOverflowPrevented`] panic. Process defaults come from [`RecursionConfig`].

mod assertions;
mod config;
mod error;
mod guard;
mod key;
mod memo;
mod stack;
mod stamp;
mod stats;

use std::fmt;
use std::hash::Hash;

pub use assertions::{
    assert_on_missed_cache, assert_on_recursion_prevention, disable_missed_cache_assertions,
    MissedCacheAssertions, PreventionAssertions,
};
pub use config::{
    RecursionConfig, ASSERT_MISSED_CACHE_ENV_VAR, ASSERT_PREVENTION_ENV_VAR,
    CAPTURE_BACKTRACES_ENV_VAR, MAX_MEMOIZED_PER_KEY_ENV_VAR,
};
pub use error::{CachingPrevented, ConfigError, StackOverflowPrevented};
pub use guard::RecursionGuard;
pub use stamp::{mark_stack, StackStamp};
pub use stats::{RecursionStats, RecursionStatsReport};

/// Create a guard named `id`. Equivalent to [`RecursionGuard::new`].
pub const fn create_guard<K>(id: &'static str) -> RecursionGuard<K> {
    RecursionGuard::new(id)
}

/// [`RecursionGuard::do_preventing_recursion`] on a guard named after the key type.
pub fn do_preventing_recursion<K, T>(
    key: K,
    memoize: bool,
    computation: impl FnOnce() -> T,
) -> Option<T>
where
    K: Hash + Eq + fmt::Debug + 'static,
    T: Clone + 'static,
{
    RecursionGuard::<K>::new(std::any::type_name::<K>()).do_preventing_recursion(
        key,
        memoize,
        computation,
    )
}

/// [`RecursionGuard::try_preventing_recursion`] on a guard named after the key type.
pub fn try_preventing_recursion<K, T, E>(
    key: K,
    memoize: bool,
    computation: impl FnOnce() -> Result<T, E>,
) -> Result<Option<T>, E>
where
    K: Hash + Eq + fmt::Debug + 'static,
    T: Clone + 'static,
{
    RecursionGuard::<K>::new(std::any::type_name::<K>()).try_preventing_recursion(
        key,
        memoize,
        computation,
    )
}

/// Number of guarded computations currently running on this thread.
pub fn stack_depth() -> usize {
    stack::with_stack(|stack| stack.depth())
}

pub fn is_stack_empty() -> bool {
    stack_depth() == 0
}

/// Number of memoized values currently held for this thread.
pub fn memoized_value_count() -> usize {
    stack::with_stack(|stack| stack.memo_len())
}

/// Drop every memoized value held for this thread.
///
/// Memoized values are dropped automatically when the outermost guarded computation exits; this
/// is for callers that invalidate inputs in the middle of one.
pub fn clear_memoized_values() {
    let garbage = stack::with_stack(|stack| stack.clear_memo());
    drop(garbage);
}
