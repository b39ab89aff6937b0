//! Fan-out of several messages with one combined outcome.
//!
//! An [`AggregateMessage`] is a unit of its own. Starting it submits its
//! entries (all at once, or one after the other) and registers the unit as
//! recipient of their replies. Each reply queues a confirmation message to the
//! unit itself, and completion is re-evaluated when that confirmation is
//! dispatched. The overall result is `Accepted` only when every entry was
//! accepted; the first failure or the timeout ends the run with `Rejected`.

use std::time::Duration;

use crate::client::execute_on;
use crate::error::KernelResult;
use crate::event_loop::EventLoop;
use crate::handle::Handle;
use crate::message::{Message, MsgResult};
use crate::unit::{Priority, Unit, UnitBehavior, UnitContext, UnitRef, UnitRunnable};

const CONFIRM: &str = "AggregateConfirm";
const RESET: &str = "AggregateReset";

/// Added to the run timeout when a caller blocks on the outcome.
const RESULT_SLACK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateMode {
    /// Every entry is submitted when the run starts.
    Parallel,
    /// The next entry is submitted once the previous one was replied.
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Waiting,
    Submitted,
    Replied(MsgResult),
}

struct Entry {
    msg: Message,
    receiver: UnitRef,
    state: EntryState,
}

/// Behavior of the aggregate unit.
pub struct Aggregate {
    mode: AggregateMode,
    entries: Vec<Entry>,
    default_receiver: UnitRef,
    start: Option<Message>,
    main: Option<Message>,
    completed: bool,
    result: MsgResult,
}

impl Aggregate {
    fn new(mode: AggregateMode) -> Self {
        Self {
            mode,
            entries: Vec::new(),
            default_receiver: Handle::null(),
            start: None,
            main: None,
            completed: false,
            result: MsgResult::Unset,
        }
    }

    fn is_running(&self) -> bool {
        self.start.is_some() && !self.completed
    }

    fn begin(&mut self, ctx: &UnitContext<'_>, start: &Message) -> MsgResult {
        if self.is_running() {
            log::warn!("{}: already running, {} rejected", ctx.name(), start.name());
            return MsgResult::Rejected;
        }
        self.start = Some(start.clone());
        self.completed = false;
        self.result = MsgResult::Unset;
        for entry in &mut self.entries {
            entry.state = EntryState::Waiting;
        }
        if let Some(tmout) = start.timeout() {
            ctx.activate_timeout(Some(tmout));
        }
        log::debug!(
            "{}: starting {} entries ({:?})",
            ctx.name(),
            self.entries.len(),
            self.mode
        );
        match self.mode {
            AggregateMode::Parallel => {
                for n in 0..self.entries.len() {
                    self.submit_entry(ctx, n);
                }
            }
            AggregateMode::Sequential => {
                if !self.entries.is_empty() {
                    self.submit_entry(ctx, 0);
                }
            }
        }
        self.evaluate(ctx);
        if self.completed {
            self.start = None;
            return self.result;
        }
        MsgResult::Postponed
    }

    fn submit_entry(&mut self, ctx: &UnitContext<'_>, n: usize) {
        let entry = &mut self.entries[n];
        entry.state = EntryState::Submitted;
        ctx.assign(&entry.msg);
        let receiver = if entry.receiver.is_null() {
            &self.default_receiver
        } else {
            &entry.receiver
        };
        match receiver.get() {
            Some(unit) => {
                unit.submit_with(entry.msg.clone(), Priority::Default);
            }
            None => {
                log::warn!("{}: no receiver for {}", ctx.name(), entry.msg.name());
                entry.msg.reply(MsgResult::Rejected);
            }
        }
    }

    /// Ends the run once an entry failed or all were accepted; in
    /// sequential mode submits the next entry otherwise.
    fn evaluate(&mut self, ctx: &UnitContext<'_>) {
        if !self.is_running() {
            return;
        }
        let mut outstanding = false;
        let mut next = None;
        for (n, entry) in self.entries.iter().enumerate() {
            match entry.state {
                EntryState::Replied(MsgResult::Accepted) => {}
                EntryState::Replied(res) => {
                    log::debug!("{}: {} replied {res}", ctx.name(), entry.msg.name());
                    self.finish(ctx, MsgResult::Rejected);
                    return;
                }
                EntryState::Submitted => outstanding = true,
                EntryState::Waiting => {
                    if next.is_none() {
                        next = Some(n);
                    }
                }
            }
        }
        match next {
            None if !outstanding => self.finish(ctx, MsgResult::Accepted),
            Some(n) if !outstanding && self.mode == AggregateMode::Sequential => {
                self.submit_entry(ctx, n)
            }
            _ => {}
        }
    }

    fn finish(&mut self, ctx: &UnitContext<'_>, res: MsgResult) {
        self.completed = true;
        self.result = res;
        ctx.activate_timeout(None);
        for entry in &mut self.entries {
            if entry.state == EntryState::Submitted {
                entry.msg.cancel();
                entry.msg.remove_caller(ctx.unit().as_sink());
                entry.state = EntryState::Replied(MsgResult::Canceled);
            }
        }
        log::debug!("{}: completed with {res}", ctx.name());
        if let Some(main) = self.main.take() {
            main.reply(res);
        }
    }

    fn reply_start(&mut self) {
        if let Some(start) = self.start.take() {
            start.reply(self.result);
        }
    }
}

impl UnitBehavior for Aggregate {
    fn execute_message(&mut self, ctx: &UnitContext<'_>, msg: &Message) -> MsgResult {
        if msg.is_name(CONFIRM) {
            if self.is_running() {
                self.evaluate(ctx);
                if self.completed {
                    self.reply_start();
                }
            }
            return MsgResult::Accepted;
        }
        if msg.is_name(RESET) {
            let res = MsgResult::from_code(msg.get_int("result", MsgResult::Canceled.code()));
            if self.is_running() {
                self.finish(ctx, res);
                self.reply_start();
            } else if let Some(main) = self.main.take() {
                main.reply(res);
            }
            self.entries.clear();
            return MsgResult::Accepted;
        }
        self.begin(ctx, msg)
    }

    fn reply_message(&mut self, ctx: &UnitContext<'_>, msg: &Message) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.state == EntryState::Submitted && e.msg.ptr_eq(msg))
        else {
            return false;
        };
        entry.state = EntryState::Replied(msg.result());
        ctx.unit()
            .submit_with(Message::new(CONFIRM), Priority::Default);
        false
    }

    fn process_timeout(&mut self, ctx: &UnitContext<'_>, _last_diff: Duration) -> Option<Duration> {
        if self.is_running() {
            log::warn!("{}: timed out", ctx.name());
            self.finish(ctx, MsgResult::Rejected);
            self.reply_start();
        }
        None
    }

    fn cleanup(&mut self, ctx: &UnitContext<'_>) {
        if self.is_running() {
            self.finish(ctx, MsgResult::Rejected);
            self.reply_start();
        }
        self.entries.clear();
    }
}

/// Owner of an aggregate unit.
pub struct AggregateMessage {
    unit: Handle<Unit<Aggregate>>,
}

impl AggregateMessage {
    pub fn new(name: impl Into<String>, mode: AggregateMode) -> Self {
        Self {
            unit: Unit::new(name, Aggregate::new(mode)),
        }
    }

    pub fn unit(&self) -> UnitRef {
        self.unit.unit_ref()
    }

    pub fn attach(&self, event_loop: &EventLoop) -> KernelResult<usize> {
        event_loop.attach(&self.unit())
    }

    pub fn set_default_receiver(&self, receiver: &UnitRef) {
        self.with(|agg| agg.default_receiver = receiver.clone());
    }

    /// Adds `msg` for the default receiver. Refused while a run is active.
    pub fn add(&self, msg: Message) -> bool {
        self.add_to(msg, &Handle::null())
    }

    /// Adds `msg` for `receiver`, overriding the default receiver.
    pub fn add_to(&self, msg: Message, receiver: &UnitRef) -> bool {
        self.with(|agg| {
            if agg.is_running() {
                return false;
            }
            agg.entries.push(Entry {
                msg,
                receiver: receiver.clone(),
                state: EntryState::Waiting,
            });
            true
        })
    }

    pub fn num_entries(&self) -> usize {
        self.with(|agg| agg.entries.len())
    }

    /// Result of each entry in insertion order; `Unset` for entries not
    /// replied yet.
    pub fn entry_results(&self) -> Vec<MsgResult> {
        self.with(|agg| {
            agg.entries
                .iter()
                .map(|e| match e.state {
                    EntryState::Replied(res) => res,
                    _ => MsgResult::Unset,
                })
                .collect()
        })
    }

    /// Outcome of the last completed run.
    pub fn result(&self) -> MsgResult {
        self.with(|agg| if agg.completed { agg.result } else { MsgResult::Unset })
    }

    pub fn is_completed(&self) -> bool {
        self.with(|agg| agg.completed)
    }

    /// Runs the aggregate and blocks for its outcome.
    pub fn execute(&self, tmout: Option<Duration>) -> MsgResult {
        let Some(unit) = self.unit.get() else {
            return MsgResult::Rejected;
        };
        let start = Message::new("AggregateRun");
        start.set_timeout(tmout);
        execute_on(
            unit,
            start,
            Priority::Default,
            tmout.map(|t| t + RESULT_SLACK),
        )
    }

    /// Starts the aggregate without waiting. `main`, if given, is replied
    /// with the outcome.
    pub fn submit(&self, main: Option<Message>, tmout: Option<Duration>) -> bool {
        let Some(unit) = self.unit.get() else {
            if let Some(main) = main {
                main.reply(MsgResult::Rejected);
            }
            return false;
        };
        let refused = self.with(|agg| {
            if agg.is_running() {
                return true;
            }
            agg.main = main.clone();
            false
        });
        if refused {
            if let Some(main) = main {
                main.reply(MsgResult::Rejected);
            }
            return false;
        }
        let start = Message::new("AggregateRun");
        start.set_timeout(tmout);
        unit.submit_with(start, Priority::Default)
    }

    /// Aborts a running aggregate: outstanding entries are canceled, the
    /// main message is replied with `res`, and every entry is dropped.
    pub fn reset(&self, res: MsgResult) -> bool {
        let Some(unit) = self.unit.get() else {
            return false;
        };
        let msg = Message::new(RESET).with("result", res.code());
        unit.submit_with(msg, Priority::Maximum)
    }

    fn with<R>(&self, f: impl FnOnce(&mut Aggregate) -> R) -> R {
        match self.unit.get() {
            Some(unit) => unit.with_behavior(f),
            None => f(&mut Aggregate::new(AggregateMode::Parallel)),
        }
    }
}
