//! The per-thread calculation stack.
//!
//! Every guarded computation running on a thread owns one [`Frame`]. Frames are strictly LIFO and
//! are always removed by activation id, so unwinding never has to compare (or hash) user keys.
//!
//! Taint is tracked with generations. The stack carries the current generation; each frame
//! remembers the generation to restore when it exits. Preventing recursion on frame `F` draws a
//! fresh, process-unique generation and overwrites the saved generation of every frame above `F`,
//! so the taint stays visible until `F` itself exits. A [`crate::StackStamp`] simply compares the
//! generation it captured with the current one.
//!
//! Nothing in this module runs user code while the stack is borrowed. Keys and values removed
//! during a borrow are returned as [`Garbage`] and dropped by the caller afterwards.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{CachingPrevented, StackOverflowPrevented};
use crate::key::GuardKey;
use crate::memo::{Dependency, MemoCandidate, MemoEntry, MemoId, MemoTable};
use crate::stats::RecursionStats;

static GENERATION: AtomicU64 = AtomicU64::new(0);

fn next_generation() -> u64 {
    GENERATION.fetch_add(1, Ordering::Relaxed) + 1
}

thread_local! {
    static STACK: RefCell<CalculationStack> = RefCell::new(CalculationStack::default());
}

/// Run `f` against this thread's stack. `f` must not run user code.
pub(crate) fn with_stack<R>(f: impl FnOnce(&mut CalculationStack) -> R) -> R {
    STACK.with(|cell| f(&mut cell.borrow_mut()))
}

/// Describe the preventions that still taint this thread's stack.
///
/// Records are copied out first; key `Debug` output is rendered with no borrow held.
pub(crate) fn caching_prevented() -> CachingPrevented {
    let records = with_stack(|stack| stack.prevention_records());
    CachingPrevented {
        prevented: records.iter().map(PreventionRecord::describe_key).collect(),
        cause: records.first().map(PreventionRecord::to_error),
    }
}

pub(crate) struct Frame {
    key: GuardKey,
    activation: u64,
    saved_generation: u64,
    /// Frames below this one on which recursion was prevented while this frame was running.
    /// Sorted by position.
    dependencies: Vec<Dependency>,
    /// Memo entries whose highest dependency is this frame.
    dependent_memos: Vec<(u64, MemoId)>,
}

impl Frame {
    fn add_dependency(&mut self, dependency: Dependency) {
        if let Err(index) = self.dependencies.binary_search(&dependency) {
            self.dependencies.insert(index, dependency);
        }
    }
}

/// A frame on which recursion was prevented (or result caching prohibited), kept until it exits.
#[derive(Clone)]
pub(crate) struct PreventionRecord {
    target: Dependency,
    key: GuardKey,
    /// Keys on the stack when the record was made, bottom first.
    stack: Vec<GuardKey>,
    trace: Option<String>,
}

impl PreventionRecord {
    /// `guard: key` of the prevented computation. Runs user `Debug` code.
    pub(crate) fn describe_key(&self) -> String {
        self.key.describe()
    }

    /// Runs user `Debug` code; must be called with no borrow held.
    pub(crate) fn to_error(&self) -> StackOverflowPrevented {
        StackOverflowPrevented {
            key: self.key.describe(),
            stack: self.stack.iter().map(GuardKey::describe).collect(),
            trace: self.trace.clone(),
        }
    }
}

/// Keys and values detached from the stack during a borrow.
///
/// Dropping them may run user `Drop` implementations, which may in turn use the guard, so this
/// must outlive the borrow that produced it.
#[derive(Default)]
#[must_use]
#[allow(dead_code)] // Held only until the borrow ends.
pub(crate) struct Garbage {
    frames: Vec<Frame>,
    memos: Vec<MemoEntry>,
    records: Vec<PreventionRecord>,
}

pub(crate) struct PopOutcome {
    pub(crate) memoized: bool,
    pub(crate) _garbage: Garbage,
}

#[derive(Default)]
pub(crate) struct CalculationStack {
    frames: Vec<Frame>,
    generation: u64,
    next_activation: u64,
    memo: MemoTable,
    preventions: Vec<PreventionRecord>,
}

impl CalculationStack {
    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn memo_len(&self) -> usize {
        self.memo.len()
    }

    pub(crate) fn keys(&self) -> Vec<GuardKey> {
        self.frames.iter().map(|frame| frame.key.clone()).collect()
    }

    /// Frames whose key may equal `key`, bottom first.
    pub(crate) fn frames_matching(&self, key: &GuardKey) -> Vec<(Dependency, GuardKey)> {
        self.frames
            .iter()
            .enumerate()
            .filter(|(_, frame)| frame.key.same_bucket(key))
            .map(|(position, frame)| {
                (
                    Dependency {
                        position,
                        activation: frame.activation,
                    },
                    frame.key.clone(),
                )
            })
            .collect()
    }

    pub(crate) fn is_active(&self, dependency: Dependency) -> bool {
        self.frames
            .get(dependency.position)
            .is_some_and(|frame| frame.activation == dependency.activation)
    }

    pub(crate) fn push(&mut self, key: GuardKey) -> Dependency {
        self.next_activation += 1;
        let activation = self.next_activation;
        let position = self.frames.len();
        self.frames.push(Frame {
            key,
            activation,
            saved_generation: self.generation,
            dependencies: Vec::new(),
            dependent_memos: Vec::new(),
        });
        Dependency {
            position,
            activation,
        }
    }

    /// Remove the frame of `activation`, optionally memoizing its result.
    ///
    /// The frame is expected on top. Frames found above it were leaked by a broken exit path;
    /// they are discarded together with it.
    pub(crate) fn pop(
        &mut self,
        activation: u64,
        memo_value: Option<Rc<dyn Any>>,
        max_memoized_per_key: usize,
    ) -> PopOutcome {
        let mut garbage = Garbage::default();

        let Some(position) = self
            .frames
            .iter()
            .rposition(|frame| frame.activation == activation)
        else {
            tracing::error!(
                target: "nova.recursion",
                activation,
                depth = self.frames.len(),
                "exiting computation is not on the calculation stack"
            );
            return PopOutcome {
                memoized: false,
                _garbage: garbage,
            };
        };

        if position + 1 != self.frames.len() {
            tracing::error!(
                target: "nova.recursion",
                position,
                depth = self.frames.len(),
                "discarding frames left above an exiting computation"
            );
            while self.frames.len() > position + 1 {
                if let Some(leaked) = self.frames.pop() {
                    self.release(&leaked, &mut garbage);
                    garbage.frames.push(leaked);
                }
            }
        }

        let mut memoized = false;
        if let Some(frame) = self.frames.pop() {
            self.generation = frame.saved_generation;
            self.release(&frame, &mut garbage);
            if let Some(value) = memo_value {
                if !self.frames.is_empty() {
                    memoized = self.store(
                        frame.key.clone(),
                        value,
                        frame.dependencies.clone(),
                        max_memoized_per_key,
                        &mut garbage,
                    );
                }
            }
            garbage.frames.push(frame);
        }

        if self.frames.is_empty() {
            self.reset(&mut garbage);
        }

        PopOutcome {
            memoized,
            _garbage: garbage,
        }
    }

    /// Drop everything that depended on `frame` still being active.
    fn release(&mut self, frame: &Frame, garbage: &mut Garbage) {
        garbage.memos.extend(self.memo.remove(&frame.dependent_memos));
        let (released, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.preventions)
            .into_iter()
            .partition(|record| record.target.activation == frame.activation);
        self.preventions = kept;
        garbage.records.extend(released);
    }

    fn store(
        &mut self,
        key: GuardKey,
        value: Rc<dyn Any>,
        dependencies: Vec<Dependency>,
        max_memoized_per_key: usize,
        garbage: &mut Garbage,
    ) -> bool {
        let anchor = dependencies.last().copied();
        if let Some(anchor) = anchor {
            if !self.is_active(anchor) {
                tracing::error!(
                    target: "nova.recursion",
                    position = anchor.position,
                    "memoized value depends on a frame that already exited; not storing it"
                );
                return false;
            }
        }

        let hash = key.hash();
        let (id, evicted) = self
            .memo
            .insert(key, value, dependencies, max_memoized_per_key);
        RecursionStats::global().record_memo_evictions(evicted.len());
        garbage.memos.extend(evicted);
        if let Some(anchor) = anchor {
            self.frames[anchor.position].dependent_memos.push((hash, id));
        }
        RecursionStats::global().record_memo_store();
        true
    }

    fn reset(&mut self, garbage: &mut Garbage) {
        if self.generation != 0 {
            tracing::error!(
                target: "nova.recursion",
                generation = self.generation,
                "taint generation outlived the outermost computation"
            );
            self.generation = 0;
        }
        garbage.memos.extend(self.memo.clear());
        garbage.records.append(&mut self.preventions);
    }

    /// Mark every frame above each of `targets` as depending on it and start a new generation.
    ///
    /// Returns `false` (and changes nothing) if a target is no longer active.
    pub(crate) fn taint_above(&mut self, targets: &[Dependency]) -> bool {
        if !targets.iter().all(|target| self.is_active(*target)) {
            return false;
        }
        self.generation = next_generation();
        let generation = self.generation;
        for target in targets {
            for frame in &mut self.frames[target.position + 1..] {
                frame.saved_generation = generation;
                frame.add_dependency(*target);
            }
        }
        true
    }

    /// Remember that `target` (holding `key`) taints the frames above it.
    ///
    /// One record is kept per target activation; a later prevention on the same frame only fills
    /// in a missing trace.
    pub(crate) fn record_prevention(
        &mut self,
        target: Dependency,
        key: GuardKey,
        trace: Option<String>,
    ) {
        if let Some(existing) = self
            .preventions
            .iter_mut()
            .find(|record| record.target == target)
        {
            if existing.trace.is_none() {
                existing.trace = trace;
            }
            return;
        }
        let stack = self.keys();
        self.preventions.push(PreventionRecord {
            target,
            key,
            stack,
            trace,
        });
    }

    /// Records of frames that still taint the stack, oldest first.
    pub(crate) fn prevention_records(&self) -> Vec<PreventionRecord> {
        self.preventions.clone()
    }

    pub(crate) fn memo_candidates(&self, key: &GuardKey) -> Vec<MemoCandidate> {
        self.memo.candidates(key)
    }

    /// Re-apply the taint of a memoized value about to be replayed.
    ///
    /// Returns `false` if the entry is gone or one of its dependencies is no longer active.
    pub(crate) fn replay_dependencies(&mut self, hash: u64, id: MemoId) -> bool {
        let Some(entry) = self.memo.get(hash, id) else {
            return false;
        };
        if entry.dependencies.is_empty() {
            return true;
        }
        let dependencies = entry.dependencies.clone();
        self.taint_above(&dependencies)
    }

    pub(crate) fn clear_memo(&mut self) -> Garbage {
        Garbage {
            memos: self.memo.clear(),
            ..Garbage::default()
        }
    }
}

/// A pushed frame. Exits normally through [`ActiveFrame::exit`]; if dropped without exiting (a
/// panic unwinding through the computation) the frame is popped without memoizing anything.
pub(crate) struct ActiveFrame {
    activation: u64,
    exited: bool,
}

impl ActiveFrame {
    pub(crate) fn enter(key: GuardKey) -> Self {
        let entered = with_stack(|stack| stack.push(key));
        RecursionStats::global().record_computation();
        Self {
            activation: entered.activation,
            exited: false,
        }
    }

    /// Pop the frame, memoizing `memo_value` when given. Returns whether the value was stored.
    pub(crate) fn exit(
        mut self,
        memo_value: Option<Rc<dyn Any>>,
        max_memoized_per_key: usize,
    ) -> bool {
        self.exited = true;
        let outcome =
            with_stack(|stack| stack.pop(self.activation, memo_value, max_memoized_per_key));
        outcome.memoized
    }
}

impl Drop for ActiveFrame {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        let popped = STACK.try_with(|cell| {
            cell.try_borrow_mut()
                .ok()
                .map(|mut stack| stack.pop(self.activation, None, 1))
        });
        match popped {
            Ok(Some(outcome)) => drop(outcome),
            Ok(None) => tracing::error!(
                target: "nova.recursion",
                activation = self.activation,
                "calculation stack is borrowed while unwinding; frame left in place"
            ),
            // Thread-local storage is being torn down; the stack goes with it.
            Err(_) => {}
        }
    }
}
