//! Units: schedulable entities bound to exactly one event loop.
//!
//! A unit pairs a user [`UnitBehavior`] with kernel-side bookkeeping
//! ([`UnitShared`]): its routing id, the message queue fed by `submit`, the
//! assign queue and events deferred while the behavior is busy. The loop only
//! talks to units through the object-safe [`UnitRunnable`] interface.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::UnitConfig;
use crate::error::{KernelError, KernelResult, LoopExit};
use crate::event_loop::{LoopInner, LoopRef};
use crate::handle::Handle;
use crate::message::{Message, MsgResult, ReadyFlag, ReplySink};
use crate::object::{NodeCore, NodeFlags, Object};
use crate::params::{self, ParamHolder};
use crate::sync::{Arc, Mutex, Weak};
use crate::trace::TraceRecord;

/// Retry interval for a timeout that fired while the unit was busy.
const BUSY_TIMEOUT_RETRY: Duration = Duration::from_millis(10);

/// Scheduling priority of an event or message.
///
/// Queue 0 is drained first. `Magic` lands in queue 0 and is accepted even
/// while the unit refuses regular submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Priority {
    Maximum,
    Minimum,
    /// Replaced by the unit's configured priority.
    Default,
    Magic,
    Level(u8),
}

impl Priority {
    /// Queue index for this priority on a loop with `num_queues` queues.
    pub fn queue_index(self, unit_default: Priority, num_queues: usize) -> usize {
        let last = num_queues.saturating_sub(1);
        match self {
            Self::Maximum | Self::Magic => 0,
            Self::Minimum => last,
            Self::Level(n) => usize::from(n).min(last),
            Self::Default => match unit_default {
                Self::Default => last,
                other => other.queue_index(Self::Minimum, num_queues),
            },
        }
    }

    pub fn is_bypass(self) -> bool {
        self == Self::Magic
    }
}

/// Event codes understood by every unit. User codes start at
/// [`EventCode::USER_FIRST`].
pub struct EventCode;

impl EventCode {
    pub const SUBMIT: u16 = 1;
    pub const REPLY: u16 = 2;
    pub const EXPLICIT_LOOP: u16 = 3;
    pub const ATTACHED: u16 = 4;
    pub const USER_FIRST: u16 = 1000;
}

/// An event routed to one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitEvent {
    pub code: u16,
    pub arg: u64,
}

impl UnitEvent {
    pub const fn new(code: u16, arg: u64) -> Self {
        Self { code, arg }
    }
}

/// User side of a unit. Every hook runs on the owning loop thread with the
/// behavior locked.
pub trait UnitBehavior: Send + 'static {
    fn on_attached(&mut self, _ctx: &UnitContext<'_>) {}

    /// Fast path run before [`UnitBehavior::execute_message`]. Anything but
    /// `Ignored` resolves the message here.
    fn preview_message(&mut self, _ctx: &UnitContext<'_>, _msg: &Message) -> MsgResult {
        MsgResult::Ignored
    }

    fn execute_message(&mut self, _ctx: &UnitContext<'_>, _msg: &Message) -> MsgResult {
        MsgResult::Ignored
    }

    /// Sees replies to messages this unit submitted or assigned. Returning
    /// true passes the reply on to the next caller of the message.
    fn reply_message(&mut self, _ctx: &UnitContext<'_>, _msg: &Message) -> bool {
        true
    }

    fn process_event(&mut self, _ctx: &UnitContext<'_>, _event: UnitEvent) {}

    /// Called when the armed timeout elapses. Returns the next delay, or
    /// `None` to disarm.
    fn process_timeout(&mut self, _ctx: &UnitContext<'_>, _last_diff: Duration) -> Option<Duration> {
        None
    }

    /// Body of an explicit loop. Returns `Err(LoopExit)` once
    /// [`UnitContext::single_loop`] reports shutdown.
    fn main_loop(&mut self, _ctx: &UnitContext<'_>) -> Result<(), LoopExit> {
        Ok(())
    }

    fn after_main_loop(&mut self, _ctx: &UnitContext<'_>) {}

    fn cleanup(&mut self, _ctx: &UnitContext<'_>) {}
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Submit,
    Reply,
}

struct QueueEntry {
    id: u64,
    kind: EntryKind,
    msg: Message,
}

#[derive(Default)]
struct UnitLink {
    event_loop: Option<LoopRef>,
    id: usize,
    accepting: bool,
}

#[derive(Default)]
struct UnitQueues {
    pending: VecDeque<QueueEntry>,
    assigned: Vec<Message>,
    deferred: VecDeque<UnitEvent>,
}

/// Kernel-side state every unit carries.
pub struct UnitShared {
    config: UnitConfig,
    link: Mutex<UnitLink>,
    queues: Mutex<UnitQueues>,
    next_id: AtomicU64,
    busy: Mutex<Option<ThreadId>>,
    holder: Mutex<Option<Arc<dyn ParamHolder>>>,
    master: Mutex<Option<Weak<dyn UnitRunnable>>>,
}

impl UnitShared {
    pub fn new(config: UnitConfig) -> Self {
        Self {
            config,
            link: Mutex::new(UnitLink::default()),
            queues: Mutex::new(UnitQueues::default()),
            next_id: AtomicU64::new(1),
            busy: Mutex::new(None),
            holder: Mutex::new(None),
            master: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &UnitConfig {
        &self.config
    }

    pub fn priority(&self) -> Priority {
        self.config.priority
    }

    pub fn id(&self) -> usize {
        self.link.lock().id
    }

    pub fn event_loop(&self) -> Option<LoopRef> {
        self.link.lock().event_loop.clone()
    }

    pub(crate) fn attached_loop(&self) -> Option<(Arc<LoopInner>, usize)> {
        let link = self.link.lock();
        if link.id == 0 {
            return None;
        }
        let lp = link.event_loop.as_ref()?.upgrade()?;
        Some((lp, link.id))
    }

    pub fn is_accepting(&self) -> bool {
        self.link.lock().accepting
    }

    pub(crate) fn set_accepting(&self, on: bool) {
        self.link.lock().accepting = on;
    }

    pub(crate) fn unbind(&self) {
        let mut link = self.link.lock();
        link.id = 0;
        link.accepting = false;
        link.event_loop = None;
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn push_entry(&self, kind: EntryKind, msg: Message) -> u64 {
        let id = self.next_id();
        self.queues
            .lock()
            .pending
            .push_back(QueueEntry { id, kind, msg });
        id
    }

    fn take_entry(&self, id: u64, kind: EntryKind) -> Option<Message> {
        let mut queues = self.queues.lock();
        let pos = queues
            .pending
            .iter()
            .position(|e| e.id == id && e.kind == kind)?;
        queues.pending.remove(pos).map(|e| e.msg)
    }

    fn defer(&self, event: UnitEvent) {
        self.queues.lock().deferred.push_back(event);
    }

    /// Hands events deferred while another thread held the behavior back to
    /// the loop. Events the loop refuses are resolved here, a submission
    /// with `Rejected`.
    pub(crate) fn refire_deferred(&self) {
        let events: Vec<UnitEvent> = self.queues.lock().deferred.drain(..).collect();
        if events.is_empty() {
            return;
        }
        let attached = self.attached_loop();
        for event in events {
            let fired = match &attached {
                Some((lp, id)) => lp.fire(*id, event, Priority::Default, self.priority()),
                None => false,
            };
            if !fired {
                self.drop_event(event);
            }
        }
    }

    fn drop_event(&self, event: UnitEvent) {
        match event.code {
            EventCode::SUBMIT => {
                if let Some(msg) = self.take_entry(event.arg, EntryKind::Submit) {
                    msg.reply(MsgResult::Rejected);
                }
            }
            EventCode::REPLY => {
                self.take_entry(event.arg, EntryKind::Reply);
            }
            _ => {}
        }
    }

    fn pop_deferred(&self) -> Option<UnitEvent> {
        self.queues.lock().deferred.pop_front()
    }

    /// Takes the oldest submission deferred while the behavior was busy.
    fn pop_deferred_submit(&self) -> Option<Message> {
        let mut queues = self.queues.lock();
        loop {
            let pos = queues
                .deferred
                .iter()
                .position(|e| e.code == EventCode::SUBMIT)?;
            let Some(event) = queues.deferred.remove(pos) else {
                return None;
            };
            let entry = queues
                .pending
                .iter()
                .position(|e| e.id == event.arg && e.kind == EntryKind::Submit)
                .and_then(|p| queues.pending.remove(p));
            if let Some(entry) = entry {
                return Some(entry.msg);
            }
        }
    }

    /// Replies every queued submission `Rejected` and drops the rest.
    pub(crate) fn reject_pending(&self) {
        let entries: Vec<QueueEntry> = {
            let mut queues = self.queues.lock();
            queues.deferred.clear();
            queues.pending.drain(..).collect()
        };
        for entry in entries {
            if entry.kind == EntryKind::Submit {
                entry.msg.reply(MsgResult::Rejected);
            }
        }
    }

    /// Binds to `event_loop` unless already bound.
    pub(crate) fn try_bind(&self, event_loop: LoopRef, id: usize) -> bool {
        let mut link = self.link.lock();
        if link.id != 0 {
            return false;
        }
        link.event_loop = Some(event_loop);
        link.id = id;
        link.accepting = true;
        true
    }

    pub fn num_pending(&self) -> usize {
        self.queues.lock().pending.len()
    }

    pub fn is_busy_on_current_thread(&self) -> bool {
        *self.busy.lock() == Some(std::thread::current().id())
    }

    fn enter_busy(&self) -> Option<ThreadId> {
        self.busy.lock().replace(std::thread::current().id())
    }

    fn leave_busy(&self, prev: Option<ThreadId>) {
        *self.busy.lock() = prev;
    }

    pub fn set_param_holder(&self, holder: Option<Arc<dyn ParamHolder>>) {
        *self.holder.lock() = holder;
    }

    pub(crate) fn param_holder(&self) -> Option<Arc<dyn ParamHolder>> {
        self.holder.lock().clone()
    }

    pub(crate) fn config_master(&self) -> Option<UnitRef> {
        let weak = self.master.lock().clone()?;
        let arc = weak.upgrade()?;
        Some(Handle::adopt(arc))
    }
}

/// Object-safe interface the event loop drives.
pub trait UnitRunnable: Object + ReplySink {
    fn shared(&self) -> &UnitShared;

    fn as_runnable(&self) -> &dyn UnitRunnable;

    fn as_sink(&self) -> &dyn ReplySink;

    fn into_object_arc(self: Arc<Self>) -> Arc<dyn Object>;

    fn sink_ref(&self) -> Weak<dyn ReplySink>;

    /// New handle on this unit, empty once destruction started.
    fn unit_ref(&self) -> UnitRef;

    #[doc(hidden)]
    fn dispatch_event(&self, event: UnitEvent);

    #[doc(hidden)]
    fn dispatch_timeout(&self, last_diff: Duration) -> Option<Duration>;

    fn id(&self) -> usize {
        self.shared().id()
    }

    fn event_loop(&self) -> Option<LoopRef> {
        self.shared().event_loop()
    }

    fn is_attached(&self) -> bool {
        self.shared().attached_loop().is_some()
    }

    /// Queues `msg` for execution. Every submission ends in exactly one
    /// reply: on refusal the message is replied `Rejected` right here.
    fn submit_with(&self, msg: Message, priority: Priority) -> bool {
        let shared = self.shared();
        let name = self.core().name();
        let Some((lp, id)) = shared.attached_loop() else {
            log::debug!("{name}: submit of {} to detached unit", msg.name());
            msg.reply(MsgResult::Rejected);
            return false;
        };
        if !shared.is_accepting() && !priority.is_bypass() {
            log::debug!("{name}: not accepting {}", msg.name());
            msg.reply(MsgResult::Rejected);
            return false;
        }
        let mid = shared.push_entry(EntryKind::Submit, msg.clone());
        msg.set_id(mid);
        // Recorded ahead of the fire: the loop may reply before it returns.
        lp.emit(TraceRecord::MessageSubmitted {
            unit: name.clone(),
            message: msg.name(),
            id: mid,
        });
        let event = UnitEvent::new(EventCode::SUBMIT, mid);
        if !lp.fire(id, event, priority, shared.priority()) {
            shared.take_entry(mid, EntryKind::Submit);
            msg.reply(MsgResult::Rejected);
            lp.emit(TraceRecord::MessageReplied {
                unit: name,
                message: msg.name(),
                result: MsgResult::Rejected.to_string(),
            });
            return false;
        }
        true
    }

    /// Registers this unit as the recipient of `msg`'s reply.
    fn assign(&self, msg: &Message) -> bool {
        if !self.core().is_normal() {
            return false;
        }
        msg.add_caller(self.sink_ref(), None);
        self.shared().queues.lock().assigned.push(msg.clone());
        true
    }

    /// Replies every queued message with `res` and drops pending
    /// assignments.
    fn cancel_all(&self, res: MsgResult) {
        let (pending, assigned, deferred) = {
            let mut queues = self.shared().queues.lock();
            let pending: Vec<QueueEntry> = queues.pending.drain(..).collect();
            let assigned = std::mem::take(&mut queues.assigned);
            queues.deferred.retain(|e| e.code >= EventCode::USER_FIRST);
            (pending, assigned, queues.deferred.len())
        };
        if !pending.is_empty() || !assigned.is_empty() {
            log::debug!(
                "{}: canceling {} queued, {} assigned, {deferred} deferred kept",
                self.core().name(),
                pending.len(),
                assigned.len()
            );
        }
        for entry in pending {
            if entry.kind == EntryKind::Submit {
                entry.msg.reply(res);
            }
        }
        for msg in assigned {
            msg.cancel();
            msg.remove_caller(self.as_sink());
        }
    }

    /// Fires a user event into the owning loop.
    fn fire_event(&self, code: u16, arg: u64, priority: Priority) -> bool {
        match self.shared().attached_loop() {
            Some((lp, id)) => lp.fire(
                id,
                UnitEvent::new(code, arg),
                priority,
                self.shared().priority(),
            ),
            None => false,
        }
    }

    /// Arms (`Some`) or disarms (`None`) the unit timeout.
    fn activate_timeout(&self, tmout: Option<Duration>) -> bool {
        match self.shared().attached_loop() {
            Some((lp, id)) => lp.set_unit_timeout(id, tmout),
            None => false,
        }
    }

    /// Detaches the unit from its loop once every queued message has been
    /// processed. Submissions are refused from the moment this is called.
    fn halt(&self) -> KernelResult<()> {
        match self.shared().attached_loop() {
            Some((lp, _)) => lp.halt_unit(self.as_runnable()),
            None => Ok(()),
        }
    }

    /// Round-trips a `SyncUnit` message at minimum priority, so every event
    /// queued before has been handled when this returns true.
    fn sync_unit(&self, tmout: Option<Duration>) -> bool {
        let msg = Message::new("SyncUnit");
        crate::client::execute_on(self.as_runnable(), msg, Priority::Minimum, tmout)
            == MsgResult::Accepted
    }

    fn set_config_master(&self, master: Option<&UnitRef>) {
        let weak = master.and_then(|m| m.arc().map(Arc::downgrade));
        *self.shared().master.lock() = weak;
    }
}

impl fmt::Debug for dyn UnitRunnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unit({}#{})", self.core().name(), self.id())
    }
}

/// Handle on any unit.
pub type UnitRef = Handle<dyn UnitRunnable>;

impl Handle<dyn UnitRunnable> {
    pub fn into_object(self) -> Handle {
        self.map(|arc| arc.into_object_arc())
    }
}

/// Per-dispatch view of the unit, handed to behavior hooks.
pub struct UnitContext<'a> {
    unit: &'a dyn UnitRunnable,
}

impl<'a> UnitContext<'a> {
    pub(crate) fn new(unit: &'a dyn UnitRunnable) -> Self {
        Self { unit }
    }

    pub fn unit(&self) -> &'a dyn UnitRunnable {
        self.unit
    }

    pub fn name(&self) -> String {
        self.unit.core().name()
    }

    pub fn id(&self) -> usize {
        self.unit.id()
    }

    pub fn unit_ref(&self) -> UnitRef {
        self.unit.unit_ref()
    }

    pub fn event_loop(&self) -> Option<LoopRef> {
        self.unit.event_loop()
    }

    pub fn fire_event(&self, code: u16, arg: u64) -> bool {
        self.unit.fire_event(code, arg, Priority::Default)
    }

    pub fn activate_timeout(&self, tmout: Option<Duration>) -> bool {
        self.unit.activate_timeout(tmout)
    }

    pub fn assign(&self, msg: &Message) -> bool {
        self.unit.assign(msg)
    }

    /// Executes `msg` on `dest` while this unit's loop keeps being served.
    pub fn execute_in(&self, dest: &UnitRef, msg: Message, tmout: Option<Duration>) -> MsgResult {
        match dest.get() {
            Some(dest) => crate::client::execute_on(dest.as_runnable(), msg, Priority::Default, tmout),
            None => {
                msg.reply(MsgResult::Rejected);
                MsgResult::Rejected
            }
        }
    }

    pub fn cfg_str(&self, name: &str, msg: Option<&Message>, default: &str) -> String {
        params::cfg_str(self.unit, name, msg, default)
    }

    pub fn cfg_int(&self, name: &str, msg: Option<&Message>, default: i64) -> i64 {
        params::cfg_int(self.unit, name, msg, default)
    }

    pub fn cfg_double(&self, name: &str, msg: Option<&Message>, default: f64) -> f64 {
        params::cfg_double(self.unit, name, msg, default)
    }

    pub fn cfg_bool(&self, name: &str, msg: Option<&Message>, default: bool) -> bool {
        params::cfg_bool(self.unit, name, msg, default)
    }

    /// Serves one turn of the owning loop for at most `tmout`.
    pub fn single_loop(&self, tmout: Duration) -> Result<(), LoopExit> {
        let Some((lp, id)) = self.unit.shared().attached_loop() else {
            return Err(LoopExit);
        };
        if lp.single_loop(Some(id), tmout) {
            Ok(())
        } else {
            Err(LoopExit)
        }
    }

    /// Serves the loop until a message for this unit arrives or `tmout`
    /// elapses. The returned message must be replied by the caller.
    pub fn wait_message(&self, tmout: Duration) -> Result<Option<Message>, LoopExit> {
        let start = Instant::now();
        loop {
            if let Some(msg) = self.unit.shared().pop_deferred_submit() {
                return Ok(Some(msg));
            }
            let left = tmout.saturating_sub(start.elapsed());
            if left.is_zero() {
                return Ok(None);
            }
            self.single_loop(left)?;
        }
    }

    /// Sleeps while keeping the owning loop serviced.
    pub fn sleep(&self, period: Duration) -> Result<(), LoopExit> {
        let start = Instant::now();
        loop {
            let left = period.saturating_sub(start.elapsed());
            if left.is_zero() {
                return Ok(());
            }
            self.single_loop(left)?;
        }
    }

    pub fn emit_trace(&self, record: TraceRecord) {
        if let Some((lp, _)) = self.unit.shared().attached_loop() {
            lp.emit(record);
        }
    }
}

/// A unit running behavior `B`.
pub struct Unit<B: UnitBehavior> {
    core: NodeCore,
    shared: UnitShared,
    me: Weak<Unit<B>>,
    behavior: Mutex<B>,
}

impl<B: UnitBehavior> Unit<B> {
    pub fn new(name: impl Into<String>, behavior: B) -> Handle<Unit<B>> {
        Self::with_config(name, UnitConfig::default(), behavior)
    }

    pub fn with_config(name: impl Into<String>, config: UnitConfig, behavior: B) -> Handle<Unit<B>> {
        let mut flags = NodeFlags::empty();
        flags.set(NodeFlags::AUTO_DESTROY, config.auto_destroy);
        flags.set(NodeFlags::LOGGING, config.logging);
        let name = name.into();
        Handle::new_cyclic(|me| Unit {
            core: NodeCore::with_flags(name, flags),
            shared: UnitShared::new(config),
            me: me.clone(),
            behavior: Mutex::new(behavior),
        })
    }

    /// Runs `f` on the behavior, blocking while a hook is running. Events
    /// the loop could not dispatch meanwhile are queued again afterwards.
    pub fn with_behavior<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        let res = {
            let mut behavior = self.behavior.lock();
            f(&mut behavior)
        };
        self.shared.refire_deferred();
        res
    }

    /// Dispatches one event; false when the behavior was busy and the event
    /// got deferred.
    fn dispatch_inner(&self, event: UnitEvent) -> bool {
        let Some(mut behavior) = self.behavior.try_lock() else {
            self.shared.defer(event);
            // A nested dispatch on this thread drains after the outer hook.
            // A foreign holder refires on release, unless it released before
            // the event was deferred.
            if !self.shared.is_busy_on_current_thread() && !self.behavior.is_locked() {
                self.shared.refire_deferred();
            }
            return false;
        };
        let prev = self.shared.enter_busy();
        let ctx = UnitContext::new(self);
        match event.code {
            EventCode::SUBMIT => self.process_submit(&mut behavior, &ctx, event.arg),
            EventCode::REPLY => self.process_reply(&mut behavior, &ctx, event.arg),
            EventCode::EXPLICIT_LOOP => self.run_main_loop(&mut behavior, &ctx),
            EventCode::ATTACHED => behavior.on_attached(&ctx),
            _ => behavior.process_event(&ctx, event),
        }
        self.shared.leave_busy(prev);
        true
    }

    fn drain_deferred(&self) {
        while let Some(event) = self.shared.pop_deferred() {
            if !self.dispatch_inner(event) {
                break;
            }
        }
    }

    fn process_submit(&self, behavior: &mut B, ctx: &UnitContext<'_>, id: u64) {
        let Some(msg) = self.shared.take_entry(id, EntryKind::Submit) else {
            return;
        };
        let res = if msg.is_canceled() {
            MsgResult::Canceled
        } else if !self.core.is_normal() {
            MsgResult::Rejected
        } else {
            let mut res = preview_builtin(&msg);
            if res == MsgResult::Ignored {
                res = behavior.preview_message(ctx, &msg);
            }
            if res == MsgResult::Ignored {
                res = behavior.execute_message(ctx, &msg);
            }
            if res == MsgResult::Ignored {
                log::warn!("{}: message {} not processed", self.core.name(), msg.name());
                res = MsgResult::Rejected;
            }
            res
        };
        if res == MsgResult::Postponed {
            return;
        }
        let message = msg.name();
        msg.reply(res);
        if let Some((lp, _)) = self.shared.attached_loop() {
            lp.emit(TraceRecord::MessageReplied {
                unit: self.core.name(),
                message,
                result: res.to_string(),
            });
        }
    }

    fn process_reply(&self, behavior: &mut B, ctx: &UnitContext<'_>, id: u64) {
        let Some(msg) = self.shared.take_entry(id, EntryKind::Reply) else {
            return;
        };
        if behavior.reply_message(ctx, &msg) && msg.has_callers() {
            msg.reply(MsgResult::Unset);
        }
    }

    fn run_main_loop(&self, behavior: &mut B, ctx: &UnitContext<'_>) {
        log::debug!("{}: entering explicit loop", self.core.name());
        if let Err(exit) = behavior.main_loop(ctx) {
            log::debug!("{}: explicit loop left: {exit}", self.core.name());
        }
        behavior.after_main_loop(ctx);
    }
}

/// Control messages every unit resolves without user code.
fn preview_builtin(msg: &Message) -> MsgResult {
    if msg.is_name("SyncUnit") {
        MsgResult::Accepted
    } else {
        MsgResult::Ignored
    }
}

impl<B: UnitBehavior> UnitRunnable for Unit<B> {
    fn shared(&self) -> &UnitShared {
        &self.shared
    }

    fn as_runnable(&self) -> &dyn UnitRunnable {
        self
    }

    fn as_sink(&self) -> &dyn ReplySink {
        self
    }

    fn into_object_arc(self: Arc<Self>) -> Arc<dyn Object> {
        self
    }

    fn sink_ref(&self) -> Weak<dyn ReplySink> {
        self.me.clone()
    }

    fn unit_ref(&self) -> UnitRef {
        match self.me.upgrade() {
            Some(arc) => Handle::adopt(arc as Arc<dyn UnitRunnable>),
            None => Handle::null(),
        }
    }

    fn dispatch_event(&self, event: UnitEvent) {
        if self.dispatch_inner(event) {
            self.drain_deferred();
        }
    }

    fn dispatch_timeout(&self, last_diff: Duration) -> Option<Duration> {
        let next = {
            let Some(mut behavior) = self.behavior.try_lock() else {
                return Some(BUSY_TIMEOUT_RETRY);
            };
            let prev = self.shared.enter_busy();
            let ctx = UnitContext::new(self);
            let next = behavior.process_timeout(&ctx, last_diff);
            self.shared.leave_busy(prev);
            next
        };
        self.drain_deferred();
        next
    }
}

impl<B: UnitBehavior> ReplySink for Unit<B> {
    fn accept_reply(&self, msg: Message, ready: Option<&ReadyFlag>) -> bool {
        if let Some(ready) = ready {
            ready.set();
            if let Some((lp, _)) = self.shared.attached_loop() {
                lp.wake();
            }
            return true;
        }
        let Some((lp, id)) = self.shared.attached_loop() else {
            return false;
        };
        self.shared
            .queues
            .lock()
            .assigned
            .retain(|m| !m.ptr_eq(&msg));
        let rid = self.shared.push_entry(EntryKind::Reply, msg);
        let event = UnitEvent::new(EventCode::REPLY, rid);
        if lp.fire(id, event, Priority::Default, self.shared.priority()) {
            true
        } else {
            self.shared.take_entry(rid, EntryKind::Reply);
            false
        }
    }
}

impl<B: UnitBehavior> Object for Unit<B> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn class_name(&self) -> &'static str {
        "Unit"
    }

    fn object_cleanup(&self) {
        if let Some((lp, id)) = self.shared.attached_loop() {
            lp.remove_unit_now(id);
        }
        self.shared.unbind();
        self.cancel_all(MsgResult::Rejected);
        match self.behavior.try_lock() {
            Some(mut behavior) => {
                let ctx = UnitContext::new(self);
                behavior.cleanup(&ctx);
            }
            None => log::warn!("{}: cleanup skipped, behavior busy", self.core.name()),
        }
    }

    fn destroy_by_owner_thread(&self) -> bool {
        match self.shared.attached_loop() {
            Some((lp, id)) => lp.request_unit_destroy(id),
            None => false,
        }
    }
}

impl<B: UnitBehavior> Handle<Unit<B>> {
    /// Type-erased handle usable by the loop and by clients.
    pub fn unit_ref(&self) -> UnitRef {
        self.clone().map(|arc| arc as Arc<dyn UnitRunnable>)
    }
}

/// Attaches `unit` to `event_loop` unless it is attached already.
pub fn attach(unit: &UnitRef, event_loop: &LoopRef) -> KernelResult<usize> {
    let Some(obj) = unit.get() else {
        return Err(KernelError::NullHandle);
    };
    if let Some((lp, _)) = obj.shared().attached_loop() {
        return Err(KernelError::AlreadyAttached {
            unit: obj.core().name(),
            event_loop: lp.name().to_string(),
        });
    }
    match event_loop.upgrade() {
        Some(lp) => lp.attach(unit),
        None => Err(KernelError::LoopNotRunning(String::new())),
    }
}
