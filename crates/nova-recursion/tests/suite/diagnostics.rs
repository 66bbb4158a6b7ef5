use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nova_recursion::{
    ConfigError, RecursionConfig, RecursionGuard, RecursionStats, RecursionStatsReport,
    ASSERT_MISSED_CACHE_ENV_VAR, MAX_MEMOIZED_PER_KEY_ENV_VAR,
};
use pretty_assertions::assert_eq;
use tracing::{field::Visit, Event};
use tracing_subscriber::{layer::Context, prelude::*, Layer};

static DIAGNOSTICS: RecursionGuard<&'static str> = RecursionGuard::new("diagnostics");

#[derive(Debug, Clone)]
struct CapturedEvent {
    target: String,
    fields: HashMap<String, String>,
}

#[derive(Clone)]
struct CapturingLayer {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl<S> Layer<S> for CapturingLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        self.events
            .lock()
            .expect("events mutex poisoned")
            .push(CapturedEvent {
                target: event.metadata().target().to_string(),
                fields: visitor.fields,
            });
    }
}

#[derive(Default)]
struct FieldVisitor {
    fields: HashMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.fields
            .insert(field.name().to_string(), format!("{value:?}"));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields
            .insert(field.name().to_string(), value.to_string());
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), value.to_string());
    }
}

#[test]
fn prevention_is_logged_with_guard_and_position() {
    let events = Arc::new(Mutex::new(Vec::<CapturedEvent>::new()));
    let layer = CapturingLayer {
        events: events.clone(),
    };
    let subscriber = tracing_subscriber::registry().with(layer);
    let _guard = tracing::subscriber::set_default(subscriber);

    DIAGNOSTICS.do_preventing_recursion("outer", false, || {
        DIAGNOSTICS.do_preventing_recursion("inner", false, || {
            DIAGNOSTICS.do_preventing_recursion("outer", false, || ());
        });
    });

    let events = events.lock().expect("events mutex poisoned");
    let prevented: Vec<_> = events
        .iter()
        .filter(|event| {
            event.target == "nova.recursion"
                && event
                    .fields
                    .get("message")
                    .is_some_and(|message| message == "prevented recursive computation")
        })
        .collect();

    assert_eq!(prevented.len(), 1, "captured: {events:?}");
    let fields = &prevented[0].fields;
    assert_eq!(fields.get("guard").map(String::as_str), Some("diagnostics"));
    assert_eq!(fields.get("position").map(String::as_str), Some("0"));
    assert!(!fields.contains_key("target"), "target must be the event target, not a field");
}

#[test]
fn stats_count_computations_preventions_and_memo_hits() {
    let before = RecursionStats::global().report();

    DIAGNOSTICS.do_preventing_recursion("stats-root", false, || {
        DIAGNOSTICS.do_preventing_recursion("stats-leaf", true, || ());
        DIAGNOSTICS.do_preventing_recursion("stats-leaf", true, || ());
        DIAGNOSTICS.do_preventing_recursion("stats-root", false, || ());
    });

    // Other tests update the same counters concurrently; only lower bounds are meaningful.
    let after = RecursionStats::global().report();
    assert!(after.computations >= before.computations + 2);
    assert!(after.preventions > before.preventions);
    assert!(after.memo_hits > before.memo_hits);
    assert!(after.memo_stores > before.memo_stores);
}

#[test]
fn stats_report_serializes_for_export() {
    let report = RecursionStatsReport {
        computations: 10,
        preventions: 2,
        memo_hits: 3,
        memo_stores: 4,
        memo_evictions: 1,
    };

    let json = serde_json::to_value(report).expect("serialize report");
    assert_eq!(
        json,
        serde_json::json!({
            "computations": 10,
            "preventions": 2,
            "memo_hits": 3,
            "memo_stores": 4,
            "memo_evictions": 1,
        })
    );
    let back: RecursionStatsReport = serde_json::from_value(json).expect("deserialize report");
    assert_eq!(back, report);
}

#[test]
fn installed_config_becomes_current() {
    let current = RecursionConfig::current();
    let replacement = RecursionConfig {
        capture_backtraces: !current.capture_backtraces,
        ..current.clone()
    };

    let previous = replacement.clone().install();
    assert_eq!(previous, current);
    assert_eq!(RecursionConfig::current(), replacement);

    previous.install();
}

#[test]
fn config_loads_from_toml_and_environment() {
    let config = RecursionConfig::from_toml_str("max_memoized_per_key = 2\n").expect("valid toml");
    assert_eq!(config.max_memoized_per_key, 2);
    assert!(!config.assert_on_missed_cache);

    let err = RecursionConfig::from_toml_str("max_memoized = 2\n").expect_err("unknown field");
    assert!(matches!(err, ConfigError::Toml(_)));

    let err = RecursionConfig::from_toml_str("max_memoized_per_key = 0\n").expect_err("zero bound");
    assert!(matches!(
        err,
        ConfigError::OutOfRange {
            field: "max_memoized_per_key",
            ..
        }
    ));

    let config = RecursionConfig::from_env_with(|var| {
        (var == ASSERT_MISSED_CACHE_ENV_VAR).then(|| "true".to_string())
    })
    .expect("valid environment");
    assert!(config.assert_on_missed_cache);

    let err = RecursionConfig::from_env_with(|var| {
        (var == MAX_MEMOIZED_PER_KEY_ENV_VAR).then(|| "many".to_string())
    })
    .expect_err("invalid number");
    assert_eq!(
        err.to_string(),
        "invalid value \"many\" for environment variable NOVA_RECURSION_MAX_MEMOIZED_PER_KEY"
    );
}
