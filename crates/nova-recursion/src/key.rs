//! Type-erased keys stored on the calculation stack.
//!
//! Every guard shares a single per-thread stack, so keys of different types (and from different
//! guards) live side by side. A [`GuardKey`] carries the guard id, the key's [`TypeId`] and a hash
//! computed once on entry. Only the hash pre-filter runs while the stack is borrowed; user `Eq`
//! and `Debug` implementations are always invoked with no internal borrow held, because they are
//! allowed to re-enter the guard.

use std::any::{Any, TypeId};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

trait ErasedKey: Any {
    fn key_eq(&self, other: &dyn ErasedKey) -> bool;
    fn describe(&self) -> String;
    fn as_any(&self) -> &dyn Any;
}

struct TypedKey<K>(K);

impl<K> ErasedKey for TypedKey<K>
where
    K: Eq + fmt::Debug + 'static,
{
    fn key_eq(&self, other: &dyn ErasedKey) -> bool {
        other
            .as_any()
            .downcast_ref::<TypedKey<K>>()
            .is_some_and(|other| other.0 == self.0)
    }

    fn describe(&self) -> String {
        format!("{:?}", self.0)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A key owned by the calculation stack (or a memo entry).
///
/// Cloning is cheap: the user key sits behind an `Rc`.
#[derive(Clone)]
pub(crate) struct GuardKey {
    guard: &'static str,
    type_id: TypeId,
    hash: u64,
    key: Rc<dyn ErasedKey>,
}

impl GuardKey {
    /// Wrap `key` for `guard`. Runs the key's `Hash` implementation exactly once.
    pub(crate) fn new<K>(guard: &'static str, key: K) -> Self
    where
        K: Hash + Eq + fmt::Debug + 'static,
    {
        let mut hasher = DefaultHasher::new();
        guard.hash(&mut hasher);
        key.hash(&mut hasher);
        Self {
            guard,
            type_id: TypeId::of::<K>(),
            hash: hasher.finish(),
            key: Rc::new(TypedKey(key)),
        }
    }

    pub(crate) fn guard(&self) -> &'static str {
        self.guard
    }

    pub(crate) fn hash(&self) -> u64 {
        self.hash
    }

    /// Cheap pre-filter that never runs user code.
    pub(crate) fn same_bucket(&self, other: &GuardKey) -> bool {
        self.hash == other.hash && self.type_id == other.type_id && self.guard == other.guard
    }

    /// Full equality. May run user code; never call this while the stack is borrowed.
    pub(crate) fn key_eq(&self, other: &GuardKey) -> bool {
        if Rc::ptr_eq(&self.key, &other.key) {
            return true;
        }
        self.same_bucket(other) && self.key.key_eq(&*other.key)
    }

    pub(crate) fn downcast_ref<K: 'static>(&self) -> Option<&K> {
        self.key
            .as_any()
            .downcast_ref::<TypedKey<K>>()
            .map(|typed| &typed.0)
    }

    /// `guard: key` using the key's `Debug` output. Runs user code.
    pub(crate) fn describe(&self) -> String {
        format!("{}: {}", self.guard, self.key.describe())
    }
}

impl fmt::Debug for GuardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardKey")
            .field("guard", &self.guard)
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}
