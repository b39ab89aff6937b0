//! Structured trace records emitted by event loops.
//!
//! A loop built with a [`TraceHook`] reports scheduling activity to it. Hooks
//! are always invoked after the loop's locks have been released.

use std::fmt;

use crate::sync::Arc;

#[cfg(feature = "serde")]
use serde::Serialize;

/// One scheduling step of an event loop.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "record", rename_all = "snake_case"))]
pub enum TraceRecord {
    LoopStarted { event_loop: String },
    LoopStopped { event_loop: String },
    UnitAttached { event_loop: String, unit: String, id: usize },
    UnitHalted { event_loop: String, unit: String, id: usize },
    /// A unit event was taken from queue `priority` and dispatched.
    Dispatch { event_loop: String, unit: String, code: u16, priority: usize },
    MessageSubmitted { unit: String, message: String, id: u64 },
    Timeout { event_loop: String, unit: String },
    MessageReplied { unit: String, message: String, result: String },
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoopStarted { event_loop } => write!(f, "{event_loop}: started"),
            Self::LoopStopped { event_loop } => write!(f, "{event_loop}: stopped"),
            Self::UnitAttached { event_loop, unit, id } => {
                write!(f, "{event_loop}: attached {unit} as #{id}")
            }
            Self::UnitHalted { event_loop, unit, id } => {
                write!(f, "{event_loop}: halted {unit} (#{id})")
            }
            Self::Dispatch {
                event_loop,
                unit,
                code,
                priority,
            } => write!(f, "{event_loop}: {unit} <- event {code} from queue {priority}"),
            Self::MessageSubmitted { unit, message, id } => {
                write!(f, "{unit}: queued {message} as #{id}")
            }
            Self::Timeout { event_loop, unit } => write!(f, "{event_loop}: timeout of {unit}"),
            Self::MessageReplied {
                unit,
                message,
                result,
            } => write!(f, "{unit}: replied {message} with {result}"),
        }
    }
}

pub type TraceHook = Arc<dyn Fn(&TraceRecord) + Send + Sync>;
