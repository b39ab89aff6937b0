//! Construction-time configuration for event loops and units.
//!
//! Values are set once when a loop or unit is built and stay immutable for
//! its whole lifetime. Nothing in the kernel reads process-wide defaults.

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::unit::Priority;

/// Configuration for one [`EventLoop`](crate::event_loop::EventLoop).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LoopConfig {
    pub name: String,
    /// Number of strict-priority event queues, never less than one.
    pub num_queues: usize,
    /// How long `stop` waits for the loop thread before declaring an error.
    pub stop_timeout: Duration,
    /// Added to a message's own timeout while a caller pumps for its reply.
    pub reply_slack: Duration,
    /// Pump step used when the awaited message carries no timeout.
    pub pump_step: Duration,
    /// Attempts made while a child list is blocked before giving up.
    pub block_retries: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            name: "Thread".to_string(),
            num_queues: 3,
            stop_timeout: Duration::from_secs(5),
            reply_slack: Duration::from_millis(500),
            pump_step: Duration::from_millis(100),
            block_retries: 1_000_000,
        }
    }
}

impl LoopConfig {
    pub fn builder() -> LoopConfigBuilder {
        LoopConfigBuilder::default()
    }
}

/// Builder for [`LoopConfig`].
#[derive(Debug, Clone, Default)]
pub struct LoopConfigBuilder {
    config: LoopConfig,
}

impl LoopConfigBuilder {
    /// Sets the loop name, also used as the OS thread name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Sets the number of priority queues. Zero is raised to one.
    pub fn num_queues(mut self, n: usize) -> Self {
        self.config.num_queues = n.max(1);
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout = timeout;
        self
    }

    pub fn reply_slack(mut self, slack: Duration) -> Self {
        self.config.reply_slack = slack;
        self
    }

    pub fn pump_step(mut self, step: Duration) -> Self {
        self.config.pump_step = step;
        self
    }

    pub fn block_retries(mut self, retries: u32) -> Self {
        self.config.block_retries = retries.max(1);
        self
    }

    pub fn build(self) -> LoopConfig {
        self.config
    }
}

/// Per-unit settings applied when the unit is constructed.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UnitConfig {
    /// Priority used for the unit's own events and timeouts.
    pub priority: Priority,
    /// Tear the unit down as soon as the last handle is released.
    pub auto_destroy: bool,
    /// Log lifecycle transitions of the unit at debug level.
    pub logging: bool,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            priority: Priority::Minimum,
            auto_destroy: true,
            logging: false,
        }
    }
}

impl UnitConfig {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_auto_destroy(mut self, on: bool) -> Self {
        self.auto_destroy = on;
        self
    }

    pub fn with_logging(mut self, on: bool) -> Self {
        self.logging = on;
        self
    }
}
