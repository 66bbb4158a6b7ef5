use std::cell::Cell;
use std::hash::{Hash, Hasher};

use nova_recursion::{
    create_guard, do_preventing_recursion, is_stack_empty, stack_depth, try_preventing_recursion,
    RecursionGuard,
};
use pretty_assertions::assert_eq;

use super::init_tracing;

static NAMES: RecursionGuard<&'static str> = RecursionGuard::new("prevention.names");

#[test]
fn nested_call_with_equal_key_returns_none() {
    init_tracing();
    let inner_ran = Cell::new(false);

    let result = NAMES.do_preventing_recursion("foo", false, || {
        let inner = NAMES.do_preventing_recursion("foo", false, || {
            inner_ran.set(true);
            "inner"
        });
        assert_eq!(inner, None);
        "outer"
    });

    assert_eq!(result, Some("outer"));
    assert!(!inner_ran.get());
    assert!(is_stack_empty());
}

#[test]
fn recursion_is_detected_through_intermediate_frames() {
    let result = NAMES.do_preventing_recursion("a", false, || {
        NAMES.do_preventing_recursion("b", false, || {
            NAMES.do_preventing_recursion("c", false, || {
                assert_eq!(stack_depth(), 3);
                NAMES.do_preventing_recursion("a", false, || 1)
            })
        })
    });
    assert_eq!(result, Some(Some(Some(None))));
}

#[test]
fn sequential_calls_with_equal_key_both_run() {
    let runs = Cell::new(0);
    NAMES.do_preventing_recursion("root", false, || {
        for _ in 0..2 {
            let value = NAMES.do_preventing_recursion("leaf", false, || {
                runs.set(runs.get() + 1);
                runs.get()
            });
            assert!(value.is_some());
        }
    });
    assert_eq!(runs.get(), 2);
}

#[test]
fn equal_values_under_different_guards_do_not_collide() {
    let supertypes: RecursionGuard<&'static str> = create_guard("prevention.supertypes");
    let members: RecursionGuard<&'static str> = create_guard("prevention.members");

    let result = supertypes.do_preventing_recursion("Foo", false, || {
        members.do_preventing_recursion("Foo", false, || {
            supertypes.do_preventing_recursion("Foo", false, || "again")
        })
    });
    assert_eq!(result, Some(Some(None)));
    assert_eq!(supertypes.id(), "prevention.supertypes");
}

#[test]
fn free_functions_use_a_guard_per_key_type() {
    let result = do_preventing_recursion(7u32, false, || {
        let same_type = do_preventing_recursion(7u32, false, || "u32");
        let other_type = do_preventing_recursion(7u64, false, || "u64");
        (same_type, other_type)
    });
    assert_eq!(result, Some((None, Some("u64"))));
}

#[test]
fn computed_none_is_distinct_from_prevention() {
    let result: Option<Option<u8>> = NAMES.do_preventing_recursion("empty", false, || None);
    assert_eq!(result, Some(None));
}

#[test]
fn fallible_computation_propagates_error() {
    let result: Result<Option<u8>, String> =
        try_preventing_recursion("fallible", false, || Err("no value".to_string()));
    assert_eq!(result, Err("no value".to_string()));
    assert!(is_stack_empty());

    let prevented: Result<Option<Option<u8>>, String> =
        try_preventing_recursion("fallible", false, || {
            try_preventing_recursion("fallible", false, || Ok(1))
        });
    assert_eq!(prevented, Ok(Some(None)));
}

thread_local! {
    static EQ_CALLS: Cell<usize> = const { Cell::new(0) };
}

/// A key whose equality check runs another guarded computation.
#[derive(Debug, Clone)]
struct ReentrantKey(u32);

impl PartialEq for ReentrantKey {
    fn eq(&self, other: &Self) -> bool {
        EQ_CALLS.with(|calls| calls.set(calls.get() + 1));
        let depth = do_preventing_recursion(("eq", self.0), false, stack_depth);
        assert!(depth.is_some());
        self.0 == other.0
    }
}

impl Eq for ReentrantKey {}

impl Hash for ReentrantKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

#[test]
fn key_equality_may_use_the_guard() {
    static REENTRANT: RecursionGuard<ReentrantKey> = RecursionGuard::new("prevention.reentrant");
    EQ_CALLS.with(|calls| calls.set(0));

    let result = REENTRANT.do_preventing_recursion(ReentrantKey(1), false, || {
        REENTRANT.do_preventing_recursion(ReentrantKey(2), false, || {
            REENTRANT.do_preventing_recursion(ReentrantKey(1), false, || "unreachable")
        })
    });

    assert_eq!(result, Some(Some(None)));
    assert!(EQ_CALLS.with(Cell::get) >= 1);
    assert!(is_stack_empty());
}

#[test]
fn current_stack_reports_outermost_first() {
    NAMES.do_preventing_recursion("outer", false, || {
        NAMES.do_preventing_recursion("inner", false, || {
            assert_eq!(NAMES.current_stack(), vec!["outer", "inner"]);
        });
        assert_eq!(NAMES.current_stack(), vec!["outer"]);
    });
    assert!(NAMES.current_stack().is_empty());
}
