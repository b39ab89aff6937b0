//! Host-side driver for the daqk kernel.
//!
//! Runs small kernel scenarios (priority ordering, timeouts, aggregates,
//! unit lifecycle, concurrent tree mutation) on real event loops and prints
//! the trace records they produce, either colored for a terminal or as one
//! JSON object per line.

mod formatter;
mod logger;
pub mod scenarios;

pub use formatter::{RecordKind, TraceFormatter};
pub use logger::ConsoleLogger;
pub use scenarios::{Outcome, Scenario};

#[cfg(test)]
mod tests;
