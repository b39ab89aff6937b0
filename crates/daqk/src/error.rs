//! Error types for recoverable kernel failures.
//!
//! Protocol failures visible to a message's caller are carried by
//! [`MsgResult`](crate::message::MsgResult); this enum covers failures of
//! kernel operations themselves. Broken invariants never come back as an
//! error: they end in [`contract_violation`].

use thiserror::Error;

use crate::event_loop::LoopState;
use crate::message::MsgResult;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("unit `{0}` is not attached to an event loop")]
    NotAttached(String),
    #[error("unit `{0}` does not accept new messages")]
    NotAccepting(String),
    #[error("unit `{unit}` is already attached to loop `{event_loop}`")]
    AlreadyAttached { unit: String, event_loop: String },
    #[error("event loop `{0}` is not running")]
    LoopNotRunning(String),
    #[error("event loop `{name}` cannot change state while {state:?}")]
    InvalidLoopState { name: String, state: LoopState },
    #[error("operation on loop `{0}` called from a foreign thread")]
    WrongThread(String),
    #[error("failed to spawn thread for loop `{name}`: {reason}")]
    Spawn { name: String, reason: String },
    #[error("halt of unit `{unit}` ended with {result}")]
    HaltFailed { unit: String, result: MsgResult },
    #[error("handle is empty")]
    NullHandle,
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Reports a broken kernel invariant and stops the current thread.
///
/// Release builds abort the process (`panic = "abort"` in the workspace
/// profile); test builds unwind so violations can be asserted on.
#[cold]
#[track_caller]
pub fn contract_violation(what: &str) -> ! {
    log::error!("contract violation: {what}");
    panic!("contract violation: {what}");
}

/// Unwind signal for explicit loops: the loop or the unit is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event loop is shutting down")]
pub struct LoopExit;
