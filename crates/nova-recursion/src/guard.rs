use std::any::Any;
use std::backtrace::Backtrace;
use std::convert::Infallible;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::assertions;
use crate::config::RecursionConfig;
use crate::error::StackOverflowPrevented;
use crate::key::GuardKey;
use crate::memo::Dependency;
use crate::stack::{with_stack, ActiveFrame};
use crate::stamp::{mark_stack, StackStamp};
use crate::stats::RecursionStats;

/// A named recursion guard for keys of type `K`.
///
/// All guards share one calculation stack per thread, so a [`StackStamp`] sees preventions from
/// every guard. Keys of different guards never compare equal, even when their values do.
///
/// ```rust,ignore
/// static SUPERTYPES: RecursionGuard<ClassId> = RecursionGuard::new("supertypes");
///
/// fn supertypes(db: &dyn Db, class: ClassId) -> Vec<ClassId> {
///     SUPERTYPES
///         .do_preventing_recursion(class, true, || compute_supertypes(db, class))
///         .unwrap_or_default()
/// }
/// ```
pub struct RecursionGuard<K> {
    id: &'static str,
    _key: PhantomData<fn(K)>,
}

impl<K> RecursionGuard<K> {
    pub const fn new(id: &'static str) -> Self {
        Self {
            id,
            _key: PhantomData,
        }
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    /// Same as the free function [`mark_stack`].
    pub fn mark_stack(&self) -> StackStamp {
        mark_stack()
    }
}

impl<K> fmt::Debug for RecursionGuard<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecursionGuard")
            .field("id", &self.id)
            .finish()
    }
}

impl<K> RecursionGuard<K>
where
    K: Hash + Eq + fmt::Debug + 'static,
{
    /// Run `computation` unless `key` is already being computed on this thread.
    ///
    /// Returns `None` when recursion was prevented; the computation is not run and every frame
    /// above the one computing `key` becomes tainted. With `memoize`, the result is kept for
    /// reuse by later calls with an equal key, but only while the frames it depends on are still
    /// active, and never beyond the outermost guarded computation.
    ///
    /// A panic from `computation` (or from the key's `Hash`/`Eq`) unwinds through the guard after
    /// the frame has been removed; nothing is memoized in that case.
    pub fn do_preventing_recursion<T>(
        &self,
        key: K,
        memoize: bool,
        computation: impl FnOnce() -> T,
    ) -> Option<T>
    where
        T: Clone + 'static,
    {
        let result: Result<Option<T>, Infallible> =
            self.try_preventing_recursion(key, memoize, || Ok(computation()));
        match result {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Like [`RecursionGuard::do_preventing_recursion`] for fallible computations.
    ///
    /// `Err` is propagated unchanged and never memoized.
    pub fn try_preventing_recursion<T, E>(
        &self,
        key: K,
        memoize: bool,
        computation: impl FnOnce() -> Result<T, E>,
    ) -> Result<Option<T>, E>
    where
        T: Clone + 'static,
    {
        run_guarded(GuardKey::new(self.id, key), memoize, computation)
    }

    /// Taint every frame above the one computing `since`, as if recursion on `since` had just
    /// been prevented.
    ///
    /// Used when a computation knows that its result depends on an incomplete value of `since`
    /// obtained some other way.
    pub fn prohibit_result_caching(&self, since: K) {
        let key = GuardKey::new(self.id, since);
        match find_on_stack(&key) {
            Some(target) => {
                let trace = capture_trace();
                let tainted = with_stack(|stack| {
                    let tainted = stack.taint_above(&[target]);
                    if tainted {
                        stack.record_prevention(target, key.clone(), trace);
                    }
                    tainted
                });
                if !tainted {
                    tracing::error!(
                        target: "nova.recursion",
                        guard = self.id,
                        "frame left the stack while prohibiting result caching"
                    );
                }
            }
            None => tracing::warn!(
                target: "nova.recursion",
                guard = self.id,
                "prohibit_result_caching called for a key that is not being computed"
            ),
        }
    }

    /// Keys of this guard currently being computed on this thread, outermost first.
    pub fn current_stack(&self) -> Vec<K>
    where
        K: Clone,
    {
        let keys = with_stack(|stack| stack.keys());
        keys.iter()
            .filter(|key| key.guard() == self.id)
            .filter_map(|key| key.downcast_ref::<K>().cloned())
            .collect()
    }
}

pub(crate) fn run_guarded<T, E>(
    key: GuardKey,
    memoize: bool,
    computation: impl FnOnce() -> Result<T, E>,
) -> Result<Option<T>, E>
where
    T: Clone + 'static,
{
    if let Some(target) = find_on_stack(&key) {
        prevent(&key, target);
        return Ok(None);
    }

    if memoize {
        if let Some(value) = replay::<T>(&key) {
            return Ok(Some(value));
        }
    }

    let frame = ActiveFrame::enter(key);
    match computation() {
        Ok(value) => {
            let memo_value = memoize.then(|| Rc::new(value.clone()) as Rc<dyn Any>);
            let max_memoized_per_key = match memo_value {
                Some(_) => RecursionConfig::current().max_memoized_per_key,
                None => 1,
            };
            frame.exit(memo_value, max_memoized_per_key);
            Ok(Some(value))
        }
        Err(err) => {
            frame.exit(None, 1);
            Err(err)
        }
    }
}

/// Locate `key` on the stack. Equality runs with no borrow held, since it may re-enter the guard.
fn find_on_stack(key: &GuardKey) -> Option<Dependency> {
    let candidates = with_stack(|stack| stack.frames_matching(key));
    candidates
        .into_iter()
        .find(|(_, candidate)| candidate.key_eq(key))
        .map(|(target, _)| target)
}

fn prevent(key: &GuardKey, target: Dependency) {
    RecursionStats::global().record_prevention();

    let assert_prevention = assertions::prevention_assertions_active();
    let trace = capture_trace();

    let tainted = with_stack(|stack| {
        let tainted = stack.taint_above(&[target]);
        if tainted {
            stack.record_prevention(target, key.clone(), trace.clone());
        }
        tainted
    });
    if !tainted {
        tracing::error!(
            target: "nova.recursion",
            guard = key.guard(),
            position = target.position,
            "recursive frame left the stack while its key was being compared"
        );
    }

    tracing::debug!(
        target: "nova.recursion",
        guard = key.guard(),
        position = target.position,
        "prevented recursive computation"
    );

    if assert_prevention {
        std::panic::panic_any(describe_prevention(key, trace));
    }
}

/// Backtrace of the current call, captured only while an assertion mode is active.
fn capture_trace() -> Option<String> {
    let asserting = assertions::prevention_assertions_active()
        || assertions::missed_cache_assertions_active();
    (asserting && RecursionConfig::current().capture_backtraces)
        .then(|| Backtrace::force_capture().to_string())
}

/// Runs user `Debug` code; must be called with no borrow held.
fn describe_prevention(key: &GuardKey, trace: Option<String>) -> StackOverflowPrevented {
    let keys = with_stack(|stack| stack.keys());
    StackOverflowPrevented {
        key: key.describe(),
        stack: keys.iter().map(GuardKey::describe).collect(),
        trace,
    }
}

fn replay<T: Clone + 'static>(key: &GuardKey) -> Option<T> {
    let candidates = with_stack(|stack| stack.memo_candidates(key));
    for candidate in candidates {
        let Some(value) = candidate.value.downcast_ref::<T>() else {
            continue;
        };
        if !candidate.key.key_eq(key) {
            continue;
        }
        if !with_stack(|stack| stack.replay_dependencies(key.hash(), candidate.id)) {
            continue;
        }

        RecursionStats::global().record_memo_hit();
        tracing::trace!(
            target: "nova.recursion",
            guard = key.guard(),
            "replaying memoized value"
        );
        return Some(value.clone());
    }
    None
}
