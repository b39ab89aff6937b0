use std::sync::{Arc, Mutex};
use std::time::Duration;

use daqk::{AggregateMode, LoopConfig, TraceHook, TraceRecord};

use crate::Scenario;

fn config(name: &str) -> LoopConfig {
    LoopConfig::builder().name(name).build()
}

fn capture() -> (TraceHook, Arc<Mutex<Vec<TraceRecord>>>) {
    let records = Arc::new(Mutex::new(Vec::new()));
    let sink = records.clone();
    let hook: TraceHook = Arc::new(move |record: &TraceRecord| {
        sink.lock().unwrap().push(record.clone());
    });
    (hook, records)
}

#[test]
fn priority_scenario_passes() {
    let (hook, records) = capture();
    let outcome = Scenario::Priority.run(&config("prio"), Some(hook)).unwrap();
    assert!(outcome.passed, "{:?}", outcome.details);
    assert!(records
        .lock()
        .unwrap()
        .iter()
        .any(|r| matches!(r, TraceRecord::Dispatch { .. })));
}

#[test]
fn timeout_scenario_passes() {
    let scenario = Scenario::Timeout {
        tmout: Duration::from_millis(200),
    };
    let outcome = scenario.run(&config("tmout"), None).unwrap();
    assert!(outcome.passed, "{:?}", outcome.details);
}

#[test]
fn aggregate_scenario_follows_rejections() {
    let accepted = Scenario::Aggregate {
        mode: AggregateMode::Parallel,
        reject: Vec::new(),
    };
    assert!(accepted.run(&config("agg"), None).unwrap().passed);

    let rejected = Scenario::Aggregate {
        mode: AggregateMode::Sequential,
        reject: vec!["R2".to_string()],
    };
    let outcome = rejected.run(&config("agg-rej"), None).unwrap();
    assert!(outcome.passed, "{:?}", outcome.details);
    assert!(outcome.details.iter().any(|d| d.contains("Rejected")));
}

#[test]
fn lifecycle_scenario_passes() {
    let outcome = Scenario::Lifecycle.run(&config("life"), None).unwrap();
    assert!(outcome.passed, "{:?}", outcome.details);
}

#[test]
fn stress_scenario_passes() {
    let outcome = Scenario::Stress { rounds: 500 }
        .run(&config("stress"), None)
        .unwrap();
    assert!(outcome.passed, "{:?}", outcome.details);
    assert_eq!(outcome.scenario, "stress");
}
