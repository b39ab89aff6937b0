//! # daqk
//!
//! Object lifecycle, event loop and message kernel for data-acquisition
//! runtimes. Nodes form a reference-counted tree whose teardown may be routed
//! to the thread that owns them; units are schedulable nodes bound to one
//! cooperative event loop and talk to each other through messages.
//!
//! ## Module Overview
//! - [`object`]     – Node core, destruction state machine and child lists.
//! - [`handle`]     – Counting handles and handle lists.
//! - [`message`]    – Messages, results, typed parameters and reply routing.
//! - [`unit`]       – Units, behaviors, priorities and submission.
//! - [`event_loop`] – Priority-queue event loops and their executor.
//! - [`client`]     – Synchronous execution, promises and message clients.
//! - [`params`]     – Unit parameters and configuration lookup.
//! - [`aggregate`]  – Combined outcome of several messages.
//! - [`trace`]      – Structured trace records.
//!
//! All locks are `parking_lot` based (see [`sync`]); recoverable failures are
//! reported as [`KernelError`] or [`MsgResult`], contract violations panic.

pub mod aggregate;
pub mod client;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod handle;
pub mod message;
pub mod object;
pub mod params;
pub mod sync;
pub mod trace;
pub mod unit;

pub use aggregate::{AggregateMessage, AggregateMode};
pub use client::{execute_on, MessageClient, MessageReceiver, Promise, ReplyChannel};
pub use config::{LoopConfig, LoopConfigBuilder, UnitConfig};
pub use error::{contract_violation, KernelError, KernelResult, LoopExit};
pub use event_loop::{sleep, EventLoop, EventLoopBuilder, LoopRef, LoopState};
pub use handle::{Handle, HandleList};
pub use message::{Message, MsgResult, ReadyFlag, ReplySink, Value};
pub use object::{name_matches, Lifecycle, Node, NodeCore, NodeFlags, NodeState, Object, Reaper};
pub use params::{MapParams, ParamHolder, Parameter};
pub use trace::{TraceHook, TraceRecord};
pub use unit::{
    EventCode, Priority, Unit, UnitBehavior, UnitContext, UnitEvent, UnitRef, UnitRunnable, UnitShared,
};

#[cfg(test)]
mod tests;
