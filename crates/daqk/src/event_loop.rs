//! Cooperative event loops (one OS thread, N strict-priority queues).
//!
//! A loop owns the slots of its attached units, indexed by unit id, and a
//! permanent executor unit at id 1 that handles control messages
//! (`ConfirmStart`, `ConfirmStop`, `ConfirmSync`, `HaltUnit`,
//! `InvokeUnitDestroy`). Queue 0 is drained first; inside a queue events
//! are FIFO. Trace records are emitted only after the scheduler lock has
//! been released.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::client::{execute_on, Promise};
use crate::config::{LoopConfig, UnitConfig};
use crate::error::{contract_violation, KernelError, KernelResult};
use crate::handle::Handle;
use crate::message::{Message, MsgResult, ReadyFlag};
use crate::object::{Lifecycle, NodeFlags, Reaper};
use crate::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use crate::trace::{TraceHook, TraceRecord};
use crate::unit::{
    EventCode, Priority, Unit, UnitBehavior, UnitContext, UnitEvent, UnitRef, UnitRunnable,
};

const EXECUTOR_ID: usize = 1;
const HALT_REQUEST: u8 = 0x1;
const DESTROY_REQUEST: u8 = 0x2;

thread_local! {
    static CURRENT: RefCell<Option<Weak<LoopInner>>> = const { RefCell::new(None) };
}

/// Lifecycle of an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum LoopState {
    Created,
    Running,
    Stopped,
    Joined,
    Error,
    Changing,
}

struct QueuedEvent {
    unit: usize,
    event: UnitEvent,
}

struct UnitSlot {
    unit: Arc<dyn UnitRunnable>,
    fired: u64,
    processed: u64,
    recursion: u32,
    halt: u8,
    waiting: Vec<Message>,
    timer: Option<Instant>,
    prev_fire: Instant,
}

impl UnitSlot {
    fn new(unit: Arc<dyn UnitRunnable>) -> Self {
        Self {
            unit,
            fired: 0,
            processed: 0,
            recursion: 0,
            halt: 0,
            waiting: Vec::new(),
            timer: None,
            prev_fire: Instant::now(),
        }
    }

    fn balance(&self) -> u64 {
        self.fired - self.processed
    }
}

struct Sched {
    state: LoopState,
    queues: Vec<VecDeque<QueuedEvent>>,
    units: Vec<Option<UnitSlot>>,
    thread: Option<ThreadId>,
    stopping: bool,
    wake: bool,
    reap: Vec<Handle>,
    compact: bool,
}

/// A unit removed from its slot, waiting for the final bookkeeping.
struct Detached {
    id: usize,
    unit: Arc<dyn UnitRunnable>,
    halt: u8,
    waiting: Vec<Message>,
}

enum Step {
    Event,
    Timer,
    Idle,
    Stop,
}

/// Handles loop-internal control messages.
struct Executor {
    event_loop: LoopRef,
}

impl UnitBehavior for Executor {
    fn execute_message(&mut self, _ctx: &UnitContext<'_>, msg: &Message) -> MsgResult {
        let Some(lp) = self.event_loop.upgrade() else {
            return MsgResult::Rejected;
        };
        let target = usize::try_from(msg.get_int("id", 0)).unwrap_or(0);
        match msg.name().as_str() {
            "ConfirmStart" | "ConfirmSync" => MsgResult::Accepted,
            "ConfirmStop" => {
                lp.request_stop();
                MsgResult::Accepted
            }
            "HaltUnit" => lp.check_unit_can_be_halted(target, HALT_REQUEST, Some(msg.clone())),
            "InvokeUnitDestroy" => {
                lp.check_unit_can_be_halted(target, DESTROY_REQUEST, Some(msg.clone()))
            }
            _ => MsgResult::Ignored,
        }
    }
}

pub(crate) struct LoopInner {
    config: LoopConfig,
    sched: Mutex<Sched>,
    cond: Condvar,
    trace: Option<TraceHook>,
    executor: Handle<Unit<Executor>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    me: Weak<LoopInner>,
}

impl LoopInner {
    fn create(config: LoopConfig, trace: Option<TraceHook>) -> Arc<Self> {
        let num_queues = config.num_queues.max(1);
        let inner = Arc::new_cyclic(|me: &Weak<LoopInner>| {
            let executor = Unit::with_config(
                format!("{}.Executor", config.name),
                UnitConfig::default().with_priority(Priority::Maximum),
                Executor {
                    event_loop: LoopRef { inner: me.clone() },
                },
            );
            LoopInner {
                sched: Mutex::new(Sched {
                    state: LoopState::Created,
                    queues: (0..num_queues).map(|_| VecDeque::new()).collect(),
                    units: vec![None],
                    thread: None,
                    stopping: false,
                    wake: false,
                    reap: Vec::new(),
                    compact: false,
                }),
                cond: Condvar::new(),
                trace,
                executor,
                thread: Mutex::new(None),
                me: me.clone(),
                config,
            }
        });
        if let Some(exec) = inner.executor.arc() {
            let unit: Arc<dyn UnitRunnable> = exec.clone();
            inner.sched.lock().units.push(Some(UnitSlot::new(unit)));
            exec.shared().try_bind(inner.loop_ref(), EXECUTOR_ID);
        }
        inner
    }

    /// The loop driven by the calling thread, if any.
    pub(crate) fn current() -> Option<Arc<LoopInner>> {
        let lp = CURRENT.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))?;
        lp.is_loop_thread().then_some(lp)
    }

    fn set_current(me: Option<Weak<LoopInner>>) {
        CURRENT.with(|c| *c.borrow_mut() = me);
    }

    fn loop_ref(&self) -> LoopRef {
        LoopRef {
            inner: self.me.clone(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn state(&self) -> LoopState {
        self.sched.lock().state
    }

    pub(crate) fn is_loop_thread(&self) -> bool {
        self.sched.lock().thread == Some(std::thread::current().id())
    }

    pub(crate) fn emit(&self, record: TraceRecord) {
        if let Some(hook) = &self.trace {
            hook(&record);
        }
    }

    fn executor(&self) -> &Unit<Executor> {
        match self.executor.get() {
            Some(exec) => exec,
            None => contract_violation("event loop without executor"),
        }
    }

    /// Wakes a thread blocked in [`LoopInner::step`] without queueing work.
    pub(crate) fn wake(&self) {
        self.sched.lock().wake = true;
        self.cond.notify_all();
    }

    /// Queues `event` for unit `id`. Refused once the loop stops, and for
    /// halting units unless `priority` is the bypass priority.
    pub(crate) fn fire(&self, id: usize, event: UnitEvent, priority: Priority, unit_default: Priority) -> bool {
        let mut s = self.sched.lock();
        if s.stopping || matches!(s.state, LoopState::Stopped | LoopState::Joined | LoopState::Error) {
            return false;
        }
        let num_queues = s.queues.len();
        let Some(Some(slot)) = s.units.get_mut(id) else {
            return false;
        };
        if slot.halt != 0 && !priority.is_bypass() {
            return false;
        }
        slot.fired += 1;
        let queue = priority.queue_index(unit_default, num_queues);
        s.queues[queue].push_back(QueuedEvent { unit: id, event });
        drop(s);
        self.cond.notify_all();
        true
    }

    pub(crate) fn set_unit_timeout(&self, id: usize, tmout: Option<Duration>) -> bool {
        let mut s = self.sched.lock();
        let Some(Some(slot)) = s.units.get_mut(id) else {
            return false;
        };
        let now = Instant::now();
        if slot.timer.is_none() {
            slot.prev_fire = now;
        }
        slot.timer = tmout.map(|d| now + d);
        drop(s);
        self.cond.notify_all();
        true
    }

    pub(crate) fn attach(&self, unit: &UnitRef) -> KernelResult<usize> {
        let Some(obj) = unit.arc().cloned() else {
            return Err(KernelError::NullHandle);
        };
        let id = {
            let mut s = self.sched.lock();
            if s.state == LoopState::Error {
                return Err(KernelError::InvalidLoopState {
                    name: self.name().to_string(),
                    state: s.state,
                });
            }
            let free = s.units.iter().skip(EXECUTOR_ID + 1).position(Option::is_none);
            let id = match free {
                Some(pos) => pos + EXECUTOR_ID + 1,
                None => {
                    s.units.push(None);
                    s.units.len() - 1
                }
            };
            s.units[id] = Some(UnitSlot::new(obj.clone()));
            id
        };
        if !obj.shared().try_bind(self.loop_ref(), id) {
            let mut s = self.sched.lock();
            s.units[id] = None;
            s.compact = true;
            return Err(KernelError::AlreadyAttached {
                unit: obj.core().name(),
                event_loop: self.name().to_string(),
            });
        }
        obj.core().set_flag(NodeFlags::HAS_OWNER_THREAD, true);
        obj.core().set_block_retries(self.config.block_retries);
        let name = obj.core().name();
        log::debug!("{}: attached {name} as #{id}", self.name());
        self.emit(TraceRecord::UnitAttached {
            event_loop: self.name().to_string(),
            unit: name,
            id,
        });
        self.fire(
            id,
            UnitEvent::new(EventCode::ATTACHED, 0),
            Priority::Maximum,
            Priority::Maximum,
        );
        Ok(id)
    }

    pub(crate) fn halt_unit(&self, unit: &dyn UnitRunnable) -> KernelResult<()> {
        let id = unit.id();
        if id == 0 {
            return Ok(());
        }
        if id == EXECUTOR_ID {
            contract_violation("the executor unit cannot be halted");
        }
        unit.shared().set_accepting(false);
        let (running, driven) = {
            let s = self.sched.lock();
            (s.state == LoopState::Running && !s.stopping, s.thread.is_some())
        };
        if !running || !driven {
            // Nobody will ever process the queued events: drop them.
            let detached = {
                let mut s = self.sched.lock();
                s.queues.iter_mut().for_each(|q| q.retain(|e| e.unit != id));
                Self::detach_slot(&mut s, id)
            };
            if let Some(d) = detached {
                self.complete_halt(d);
            }
            return Ok(());
        }
        let msg = Message::new("HaltUnit").with("id", id as i64);
        if unit.shared().is_busy_on_current_thread() {
            // Self-halt from a hook; completes once the hook returns.
            self.executor().submit_with(msg, Priority::Magic);
            return Ok(());
        }
        let res = execute_on(
            self.executor(),
            msg,
            Priority::Magic,
            Some(self.config.stop_timeout),
        );
        match res {
            MsgResult::Accepted => Ok(()),
            result => Err(KernelError::HaltFailed {
                unit: unit.core().name(),
                result,
            }),
        }
    }

    /// Halts unit `id` once nothing of it is queued or running. Otherwise
    /// the request is remembered and `msg` replied when the halt completes.
    fn check_unit_can_be_halted(&self, id: usize, request: u8, msg: Option<Message>) -> MsgResult {
        let mut s = self.sched.lock();
        let Some(Some(slot)) = s.units.get_mut(id) else {
            log::debug!("{}: unit #{id} no longer exists", self.name());
            return MsgResult::Rejected;
        };
        slot.halt |= request;
        let unit = slot.unit.clone();
        if slot.recursion > 0 || slot.balance() > 0 {
            if slot.recursion > 0 {
                log::warn!(
                    "{}: halt of unit #{id} postponed, recursion {} balance {}",
                    self.name(),
                    slot.recursion,
                    slot.balance()
                );
            }
            if let Some(msg) = msg {
                slot.waiting.push(msg);
            }
            drop(s);
            unit.shared().set_accepting(false);
            return MsgResult::Postponed;
        }
        let detached = Self::detach_slot(&mut s, id);
        drop(s);
        if let Some(d) = detached {
            self.complete_halt(d);
        }
        MsgResult::Accepted
    }

    fn detach_slot(s: &mut MutexGuard<'_, Sched>, id: usize) -> Option<Detached> {
        let slot = s.units.get_mut(id)?.take()?;
        s.compact = true;
        Some(Detached {
            id,
            unit: slot.unit,
            halt: slot.halt,
            waiting: slot.waiting,
        })
    }

    fn complete_halt(&self, d: Detached) {
        let name = d.unit.core().name();
        d.unit.shared().unbind();
        d.unit.core().set_flag(NodeFlags::HAS_OWNER_THREAD, false);
        d.unit.shared().reject_pending();
        log::debug!("{}: halted {name} (#{})", self.name(), d.id);
        self.emit(TraceRecord::UnitHalted {
            event_loop: self.name().to_string(),
            unit: name,
            id: d.id,
        });
        if d.halt & DESTROY_REQUEST != 0 {
            d.unit.destroy_from_owner_thread();
        }
        for msg in d.waiting {
            msg.reply(MsgResult::Accepted);
        }
    }

    /// Detaches unit `id` right away, skipping the halt protocol. Used by
    /// units tearing down while their loop does not run.
    pub(crate) fn remove_unit_now(&self, id: usize) {
        if id == EXECUTOR_ID {
            return;
        }
        let detached = {
            let mut s = self.sched.lock();
            s.queues.iter_mut().for_each(|q| q.retain(|e| e.unit != id));
            Self::detach_slot(&mut s, id)
        };
        if let Some(mut d) = detached {
            d.halt = 0;
            self.complete_halt(d);
        }
    }

    /// Hands teardown of unit `id` to the loop thread.
    pub(crate) fn request_unit_destroy(&self, id: usize) -> bool {
        if self.state() != LoopState::Running {
            return false;
        }
        let msg = Message::new("InvokeUnitDestroy").with("id", id as i64);
        self.executor().submit_with(msg, Priority::Magic)
    }

    fn request_stop(&self) {
        self.sched.lock().stopping = true;
        self.cond.notify_all();
    }

    /// One turn of the loop: due timers, else one event, else wait for
    /// work until `max_wait` runs out.
    fn step(&self, max_wait: Option<Duration>) -> Step {
        let deadline = max_wait.map(|d| Instant::now() + d);
        let mut s = self.sched.lock();
        loop {
            if s.stopping {
                return Step::Stop;
            }
            let now = Instant::now();

            let mut due = Vec::new();
            for slot in s.units.iter_mut().flatten() {
                if slot.halt == 0 && slot.timer.map_or(false, |t| t <= now) {
                    slot.timer = None;
                    let diff = now.saturating_duration_since(slot.prev_fire);
                    slot.prev_fire = now;
                    due.push((slot.unit.clone(), diff));
                }
            }
            if !due.is_empty() {
                drop(s);
                for (unit, diff) in due {
                    self.fire_timeout(unit, diff);
                }
                return Step::Timer;
            }

            let next = s
                .queues
                .iter_mut()
                .enumerate()
                .find_map(|(q, queue)| queue.pop_front().map(|e| (q, e)));
            if let Some((queue, ev)) = next {
                let unit = match s.units.get_mut(ev.unit) {
                    Some(Some(slot)) => {
                        slot.recursion += 1;
                        slot.unit.clone()
                    }
                    _ => continue,
                };
                drop(s);
                self.dispatch(unit, ev, queue);
                return Step::Event;
            }

            if s.wake {
                s.wake = false;
                return Step::Idle;
            }
            if !s.reap.is_empty() {
                let reap = std::mem::take(&mut s.reap);
                drop(s);
                drop(reap);
                return Step::Idle;
            }
            if s.compact {
                while s.units.len() > EXECUTOR_ID + 1 && s.units.last().map_or(false, Option::is_none) {
                    s.units.pop();
                }
                s.compact = false;
            }

            let nearest = s.units.iter().flatten().filter_map(|slot| slot.timer).min();
            let wake_at = match (nearest, deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            if deadline.map_or(false, |d| d <= now) {
                return Step::Idle;
            }
            match wake_at {
                Some(at) => {
                    self.cond.wait_until(&mut s, at);
                }
                None => self.cond.wait(&mut s),
            }
        }
    }

    fn dispatch(&self, unit: Arc<dyn UnitRunnable>, ev: QueuedEvent, queue: usize) {
        if self.trace.is_some() {
            self.emit(TraceRecord::Dispatch {
                event_loop: self.name().to_string(),
                unit: unit.core().name(),
                code: ev.event.code,
                priority: queue,
            });
        }
        log::trace!(
            "{}: event {} arg {} -> #{} from queue {queue}",
            self.name(),
            ev.event.code,
            ev.event.arg,
            ev.unit
        );
        unit.dispatch_event(ev.event);
        self.finish_event(ev.unit);
    }

    fn finish_event(&self, id: usize) {
        let mut s = self.sched.lock();
        let Some(Some(slot)) = s.units.get_mut(id) else {
            return;
        };
        slot.recursion = slot.recursion.saturating_sub(1);
        slot.processed += 1;
        if slot.halt == 0 || slot.recursion > 0 || slot.balance() > 0 {
            return;
        }
        let detached = Self::detach_slot(&mut s, id);
        drop(s);
        if let Some(d) = detached {
            self.complete_halt(d);
        }
    }

    fn fire_timeout(&self, unit: Arc<dyn UnitRunnable>, diff: Duration) {
        let id = unit.id();
        if self.trace.is_some() {
            self.emit(TraceRecord::Timeout {
                event_loop: self.name().to_string(),
                unit: unit.core().name(),
            });
        }
        {
            let mut s = self.sched.lock();
            if let Some(Some(slot)) = s.units.get_mut(id) {
                slot.recursion += 1;
            }
        }
        let next = unit.dispatch_timeout(diff);
        let mut s = self.sched.lock();
        let Some(Some(slot)) = s.units.get_mut(id) else {
            return;
        };
        slot.recursion = slot.recursion.saturating_sub(1);
        if let Some(next) = next {
            // Re-armed from the hook itself takes precedence.
            if slot.timer.is_none() {
                slot.timer = Some(Instant::now() + next);
            }
        }
        if slot.halt != 0 && slot.recursion == 0 && slot.balance() == 0 {
            let detached = Self::detach_slot(&mut s, id);
            drop(s);
            if let Some(d) = detached {
                self.complete_halt(d);
            }
        }
    }

    /// Serves one turn for the calling loop thread. False once the loop
    /// stops or unit `unit` is halting.
    pub(crate) fn single_loop(&self, unit: Option<usize>, tmout: Duration) -> bool {
        if !self.is_loop_thread() {
            log::warn!("{}: single_loop called from a foreign thread", self.name());
            return false;
        }
        if let Some(id) = unit {
            let s = self.sched.lock();
            match s.units.get(id) {
                Some(Some(slot)) if slot.halt == 0 => {}
                _ => return false,
            }
        }
        !matches!(self.step(Some(tmout)), Step::Stop)
    }

    fn run_for(&self, period: Duration) {
        let start = Instant::now();
        loop {
            let left = period.saturating_sub(start.elapsed());
            if left.is_zero() {
                break;
            }
            if let Step::Stop = self.step(Some(left)) {
                break;
            }
        }
    }

    /// Executes `msg` on `unit` while this thread keeps serving its loop.
    pub(crate) fn execute_pumping(
        &self,
        unit: &dyn UnitRunnable,
        msg: Message,
        priority: Priority,
        tmout: Option<Duration>,
    ) -> MsgResult {
        let ready = ReadyFlag::new();
        msg.add_caller(self.executor().sink_ref(), Some(ready.clone()));
        let budget = tmout.or_else(|| msg.time_till_timeout().map(|t| t + self.config.reply_slack));
        unit.submit_with(msg.clone(), priority);

        let start = Instant::now();
        let mut stopped = false;
        while !ready.is_set() {
            let step = match budget {
                Some(budget) => {
                    let left = budget.saturating_sub(start.elapsed());
                    if left.is_zero() {
                        break;
                    }
                    left
                }
                None => self.config.pump_step,
            };
            if let Step::Stop = self.step(Some(step)) {
                stopped = true;
                break;
            }
        }
        msg.remove_ready_caller(&ready);
        if ready.is_set() {
            return msg.result();
        }
        if stopped {
            return MsgResult::Rejected;
        }
        log::debug!(
            "{}: {} on {} timed out after {:?}",
            self.name(),
            msg.name(),
            unit.core().name(),
            start.elapsed()
        );
        MsgResult::TimedOut
    }

    fn start(&self, tmout: Option<Duration>) -> KernelResult<()> {
        {
            let mut s = self.sched.lock();
            match s.state {
                LoopState::Created | LoopState::Stopped | LoopState::Joined => {}
                LoopState::Running => return Ok(()),
                state => {
                    return Err(KernelError::InvalidLoopState {
                        name: self.name().to_string(),
                        state,
                    })
                }
            }
            s.state = LoopState::Changing;
            s.stopping = false;
        }
        if let Some(old) = self.thread.lock().take() {
            let _ = old.join();
        }
        let Some(me) = self.me.upgrade() else {
            return Err(KernelError::LoopNotRunning(self.name().to_string()));
        };
        let spawned = std::thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || me.thread_main());
        match spawned {
            Ok(handle) => *self.thread.lock() = Some(handle),
            Err(err) => {
                self.sched.lock().state = LoopState::Error;
                return Err(KernelError::Spawn {
                    name: self.name().to_string(),
                    reason: err.to_string(),
                });
            }
        }
        let confirm = Message::new("ConfirmStart");
        match Promise::submit(self.executor(), confirm, Priority::Minimum).wait(tmout) {
            MsgResult::Accepted => Ok(()),
            _ => {
                let state = {
                    let mut s = self.sched.lock();
                    s.state = LoopState::Error;
                    s.state
                };
                Err(KernelError::InvalidLoopState {
                    name: self.name().to_string(),
                    state,
                })
            }
        }
    }

    fn thread_main(self: Arc<Self>) {
        Self::set_current(Some(self.me.clone()));
        {
            let mut s = self.sched.lock();
            s.thread = Some(std::thread::current().id());
            s.state = LoopState::Running;
        }
        log::debug!("{}: thread started", self.name());
        self.emit(TraceRecord::LoopStarted {
            event_loop: self.name().to_string(),
        });
        while !matches!(self.step(None), Step::Stop) {}
        self.finish_run();
        Self::set_current(None);
    }

    fn start_in_current_thread(&self) -> KernelResult<()> {
        {
            let mut s = self.sched.lock();
            match s.state {
                LoopState::Created | LoopState::Stopped | LoopState::Joined => {}
                state => {
                    return Err(KernelError::InvalidLoopState {
                        name: self.name().to_string(),
                        state,
                    })
                }
            }
            s.state = LoopState::Running;
            s.stopping = false;
            s.thread = Some(std::thread::current().id());
        }
        Self::set_current(Some(self.me.clone()));
        self.emit(TraceRecord::LoopStarted {
            event_loop: self.name().to_string(),
        });
        Ok(())
    }

    /// Leaves Running: unqueued work is rejected, deferred drops run.
    fn finish_run(&self) {
        let (units, reap) = {
            let mut s = self.sched.lock();
            s.state = LoopState::Stopped;
            s.thread = None;
            s.queues.iter_mut().for_each(VecDeque::clear);
            for slot in s.units.iter_mut().flatten() {
                slot.processed = slot.fired;
            }
            let units: Vec<Arc<dyn UnitRunnable>> =
                s.units.iter().flatten().map(|slot| slot.unit.clone()).collect();
            (units, std::mem::take(&mut s.reap))
        };
        for unit in units {
            unit.shared().reject_pending();
        }
        drop(reap);
        log::debug!("{}: stopped", self.name());
        self.emit(TraceRecord::LoopStopped {
            event_loop: self.name().to_string(),
        });
    }

    fn stop(&self) -> KernelResult<()> {
        let (state, own_thread) = {
            let s = self.sched.lock();
            (s.state, s.thread == Some(std::thread::current().id()))
        };
        match state {
            LoopState::Running => {}
            LoopState::Created | LoopState::Joined => return Ok(()),
            LoopState::Stopped => return self.join_thread(),
            state => {
                return Err(KernelError::InvalidLoopState {
                    name: self.name().to_string(),
                    state,
                })
            }
        }
        let spawned = self.thread.lock().is_some();
        if !spawned {
            // Driven by a user thread: nothing to join.
            self.request_stop();
            if own_thread {
                Self::set_current(None);
            }
            self.finish_run();
            return Ok(());
        }
        if own_thread {
            self.request_stop();
            return Ok(());
        }
        let confirm = Message::new("ConfirmStop");
        let res = Promise::submit(self.executor(), confirm, Priority::Minimum)
            .wait(Some(self.config.stop_timeout));
        if res != MsgResult::Accepted {
            log::warn!("{}: stop not confirmed ({res}), forcing", self.name());
            self.request_stop();
        }
        self.join_thread()
    }

    fn join_thread(&self) -> KernelResult<()> {
        let Some(handle) = self.thread.lock().take() else {
            return Ok(());
        };
        let start = Instant::now();
        while !handle.is_finished() {
            if start.elapsed() >= self.config.stop_timeout {
                log::warn!("{}: thread did not finish within {:?}", self.name(), self.config.stop_timeout);
                let state = {
                    let mut s = self.sched.lock();
                    s.state = LoopState::Error;
                    s.state
                };
                return Err(KernelError::InvalidLoopState {
                    name: self.name().to_string(),
                    state,
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        if handle.join().is_err() {
            log::error!("{}: loop thread panicked", self.name());
            self.sched.lock().state = LoopState::Error;
            return Ok(());
        }
        self.sched.lock().state = LoopState::Joined;
        Ok(())
    }

    /// Releases every attached unit. Used when the owning handle goes away.
    fn detach_all(&self) {
        let detached: Vec<Detached> = {
            let mut s = self.sched.lock();
            let ids: Vec<usize> = (EXECUTOR_ID + 1..s.units.len()).collect();
            ids.into_iter()
                .filter_map(|id| Self::detach_slot(&mut s, id))
                .collect()
        };
        for mut d in detached {
            d.halt = 0;
            self.complete_halt(d);
        }
    }

    fn defer_drop(&self, obj: Handle) {
        let mut s = self.sched.lock();
        if s.state == LoopState::Running && !s.stopping {
            s.reap.push(obj);
            drop(s);
            self.cond.notify_all();
        } else {
            drop(s);
            drop(obj);
        }
    }

    fn num_units(&self) -> usize {
        self.sched
            .lock()
            .units
            .iter()
            .skip(EXECUTOR_ID + 1)
            .filter(|slot| slot.is_some())
            .count()
    }
}

/// Weak, clonable reference on an event loop.
#[derive(Clone)]
pub struct LoopRef {
    inner: Weak<LoopInner>,
}

impl LoopRef {
    pub(crate) fn upgrade(&self) -> Option<Arc<LoopInner>> {
        self.inner.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    pub fn name(&self) -> Option<String> {
        self.upgrade().map(|lp| lp.name().to_string())
    }

    pub fn state(&self) -> Option<LoopState> {
        self.upgrade().map(|lp| lp.state())
    }

    pub fn is_current_thread(&self) -> bool {
        self.upgrade().map_or(false, |lp| lp.is_loop_thread())
    }

    pub fn ptr_eq(&self, other: &LoopRef) -> bool {
        Weak::ptr_eq(&self.inner, &other.inner)
    }

    /// Waits until every event queued before this call has been handled.
    pub fn sync(&self, tmout: Option<Duration>) -> KernelResult<()> {
        let lp = self
            .upgrade()
            .ok_or_else(|| KernelError::LoopNotRunning(String::new()))?;
        sync_loop(&lp, tmout)
    }
}

impl Reaper for LoopRef {
    fn reap(&self, obj: Handle) {
        match self.upgrade() {
            Some(lp) => lp.defer_drop(obj),
            None => drop(obj),
        }
    }
}

impl fmt::Debug for LoopRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(lp) => write!(f, "LoopRef({})", lp.name()),
            None => f.write_str("LoopRef(gone)"),
        }
    }
}

fn sync_loop(lp: &LoopInner, tmout: Option<Duration>) -> KernelResult<()> {
    if lp.state() != LoopState::Running {
        return Err(KernelError::LoopNotRunning(lp.name().to_string()));
    }
    let msg = Message::new("ConfirmSync");
    match execute_on(lp.executor(), msg, Priority::Minimum, tmout) {
        MsgResult::Accepted => Ok(()),
        _ => Err(KernelError::LoopNotRunning(lp.name().to_string())),
    }
}

/// Builder for [`EventLoop`].
pub struct EventLoopBuilder {
    config: LoopConfig,
    trace: Option<TraceHook>,
}

impl EventLoopBuilder {
    pub fn new(config: LoopConfig) -> Self {
        Self {
            config,
            trace: None,
        }
    }

    pub fn with_trace_hook(mut self, hook: TraceHook) -> Self {
        self.trace = Some(hook);
        self
    }

    pub fn build(self) -> EventLoop {
        EventLoop {
            inner: LoopInner::create(self.config, self.trace),
        }
    }
}

/// Owner of an event loop. Dropping it stops the loop and detaches every
/// unit.
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    pub fn new(config: LoopConfig) -> Self {
        EventLoopBuilder::new(config).build()
    }

    pub fn builder(config: LoopConfig) -> EventLoopBuilder {
        EventLoopBuilder::new(config)
    }

    /// The loop the calling thread is driving, if any.
    pub fn current() -> Option<LoopRef> {
        LoopInner::current().map(|lp| lp.loop_ref())
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn config(&self) -> &LoopConfig {
        &self.inner.config
    }

    pub fn state(&self) -> LoopState {
        self.inner.state()
    }

    pub fn downgrade(&self) -> LoopRef {
        self.inner.loop_ref()
    }

    pub fn is_current_thread(&self) -> bool {
        self.inner.is_loop_thread()
    }

    pub fn trace_hook(&self) -> Option<TraceHook> {
        self.inner.trace.clone()
    }

    pub fn executor(&self) -> UnitRef {
        self.inner.executor().unit_ref()
    }

    /// Number of attached units, the executor not counted.
    pub fn num_units(&self) -> usize {
        self.inner.num_units()
    }

    /// Routes deferred destruction of nodes onto this loop's idle turns.
    pub fn reaper(&self) -> Arc<dyn Reaper> {
        Arc::new(self.downgrade())
    }

    /// Spawns the loop thread and waits for it to confirm.
    pub fn start(&self, tmout: Option<Duration>) -> KernelResult<()> {
        self.inner.start(tmout)
    }

    /// Makes the calling thread the loop thread. The caller then drives the
    /// loop through [`EventLoop::run_event_loop`] or
    /// [`EventLoop::single_loop`].
    pub fn start_in_current_thread(&self) -> KernelResult<()> {
        self.inner.start_in_current_thread()
    }

    /// Stops the loop after every event queued so far and joins its thread.
    pub fn stop(&self) -> KernelResult<()> {
        self.inner.stop()
    }

    pub fn sync(&self, tmout: Option<Duration>) -> KernelResult<()> {
        sync_loop(&self.inner, tmout)
    }

    pub fn attach(&self, unit: &UnitRef) -> KernelResult<usize> {
        crate::unit::attach(unit, &self.downgrade())
    }

    pub fn halt_unit(&self, unit: &UnitRef) -> KernelResult<()> {
        match unit.get() {
            Some(u) => self.inner.halt_unit(u.as_runnable()),
            None => Err(KernelError::NullHandle),
        }
    }

    /// Lets `unit` take over the loop body through its `main_loop` hook.
    pub fn set_explicit_loop(&self, unit: &UnitRef) -> KernelResult<()> {
        let Some(u) = unit.get() else {
            return Err(KernelError::NullHandle);
        };
        let own = u
            .event_loop()
            .map_or(false, |lp| lp.ptr_eq(&self.downgrade()));
        if !own || u.id() == 0 {
            return Err(KernelError::NotAttached(u.core().name()));
        }
        let fired = self.inner.fire(
            u.id(),
            UnitEvent::new(EventCode::EXPLICIT_LOOP, 0),
            Priority::Maximum,
            Priority::Maximum,
        );
        if fired {
            Ok(())
        } else {
            Err(KernelError::NotAccepting(u.core().name()))
        }
    }

    /// One turn of the loop on the driving thread. Returns false when the
    /// loop stops or `unit` is halting.
    pub fn single_loop(&self, unit: Option<&UnitRef>, tmout: Duration) -> bool {
        let id = match unit {
            Some(u) => match u.get() {
                Some(u) => Some(u.id()),
                None => return false,
            },
            None => None,
        };
        self.inner.single_loop(id, tmout)
    }

    /// Serves events on the driving thread for `period`.
    pub fn run_event_loop(&self, period: Duration) -> KernelResult<()> {
        if !self.inner.is_loop_thread() {
            return Err(KernelError::WrongThread(self.name().to_string()));
        }
        self.inner.run_for(period);
        Ok(())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Err(err) = self.inner.stop() {
            log::error!("{}: {err}", self.name());
        }
        self.inner.detach_all();
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("units", &self.num_units())
            .finish()
    }
}

/// Sleeps for `period`, serving the calling thread's loop if it drives one.
pub fn sleep(period: Duration) {
    match LoopInner::current() {
        Some(lp) => lp.run_for(period),
        None => std::thread::sleep(period),
    }
}
