//! Tests for LoopConfig builder and defaults.

use std::time::Duration;

use daqk::{EventLoop, LoopConfig, LoopState, Priority, UnitConfig};

#[test]
fn loop_config_builder() {
    let config = LoopConfig::builder()
        .name("Acquisition")
        .num_queues(5)
        .stop_timeout(Duration::from_secs(1))
        .reply_slack(Duration::from_millis(50))
        .pump_step(Duration::from_millis(10))
        .block_retries(100)
        .build();

    assert_eq!(config.name, "Acquisition");
    assert_eq!(config.num_queues, 5);
    assert_eq!(config.stop_timeout, Duration::from_secs(1));
    assert_eq!(config.reply_slack, Duration::from_millis(50));
    assert_eq!(config.pump_step, Duration::from_millis(10));
    assert_eq!(config.block_retries, 100);
}

#[test]
fn loop_config_default() {
    let config = LoopConfig::default();

    assert_eq!(config.name, "Thread");
    assert_eq!(config.num_queues, 3);
    assert_eq!(config.stop_timeout, Duration::from_secs(5));
    assert_eq!(config.reply_slack, Duration::from_millis(500));
}

#[test]
fn zero_queues_is_raised_to_one() {
    let config = LoopConfig::builder().num_queues(0).block_retries(0).build();
    assert_eq!(config.num_queues, 1);
    assert_eq!(config.block_retries, 1);
}

#[test]
fn unit_config_default() {
    let config = UnitConfig::default();
    assert_eq!(config.priority, Priority::Minimum);
    assert!(config.auto_destroy);
    assert!(!config.logging);

    let config = config.with_priority(Priority::Level(1)).with_logging(true);
    assert_eq!(config.priority, Priority::Level(1));
    assert!(config.logging);
}

#[test]
fn loop_with_custom_config() {
    let config = LoopConfig::builder().name("Custom").num_queues(4).build();
    let event_loop = EventLoop::new(config);

    assert_eq!(event_loop.name(), "Custom");
    assert_eq!(event_loop.config().num_queues, 4);
    assert_eq!(event_loop.state(), LoopState::Created);
    assert_eq!(event_loop.num_units(), 0);
}
