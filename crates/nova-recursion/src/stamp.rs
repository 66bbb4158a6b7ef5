use std::marker::PhantomData;

use crate::assertions;
use crate::error::CachingPrevented;
use crate::stack::{self, with_stack};

/// Snapshot of the calling thread's taint state, taken by [`mark_stack`].
///
/// Typical use is guarding a long-lived cache:
///
/// ```rust,ignore
/// let stamp = nova_recursion::mark_stack();
/// let value = compute_supertypes(class);
/// if stamp.may_cache_now() {
///     cache.insert(class, value.clone());
/// }
/// ```
///
/// Stamps describe the stack of the thread that created them and are therefore `!Send`.
#[derive(Debug, Clone)]
pub struct StackStamp {
    depth: usize,
    generation: u64,
    _thread: PhantomData<*const ()>,
}

/// Capture the current taint state of this thread's calculation stack.
pub fn mark_stack() -> StackStamp {
    let (depth, generation) = with_stack(|stack| (stack.depth(), stack.generation()));
    StackStamp {
        depth,
        generation,
        _thread: PhantomData,
    }
}

impl StackStamp {
    /// Stack depth at the time the stamp was taken.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether a value computed since the stamp was taken is complete and may be cached.
    ///
    /// Returns `false` once recursion has been prevented on a frame that was already active when
    /// the stamp was taken, and keeps returning `false` for as long as that frame is active.
    /// Recursion prevented on frames entered after the stamp does not count once those frames
    /// have exited: their results were complete.
    ///
    /// # Panics
    ///
    /// Panics with a [`CachingPrevented`] payload when the answer is `false` and missed-cache
    /// assertions are active on this thread (see [`crate::assert_on_missed_cache`]).
    pub fn may_cache_now(&self) -> bool {
        match self.check_may_cache() {
            Ok(may_cache) => may_cache,
            Err(err) => std::panic::panic_any(err),
        }
    }

    /// Non-panicking form of [`StackStamp::may_cache_now`].
    ///
    /// Returns `Err` instead of panicking when missed-cache assertions are active.
    pub fn check_may_cache(&self) -> Result<bool, CachingPrevented> {
        let generation = with_stack(|stack| stack.generation());
        if generation == self.generation {
            return Ok(true);
        }
        if !assertions::missed_cache_assertions_active() {
            return Ok(false);
        }

        let err = stack::caching_prevented();
        tracing::debug!(
            target: "nova.recursion",
            depth = self.depth,
            prevented = err.prevented.len(),
            "caching requested after recursion was prevented"
        );
        Err(err)
    }
}
