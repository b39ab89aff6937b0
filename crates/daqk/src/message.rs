//! Messages: the call contract between units, loops and foreign threads.
//!
//! A [`Message`] is a shared handle on a named parameter map plus a result
//! slot. Whoever waits for the outcome registers itself as a caller; the
//! reply walks the caller stack from the top until one sink accepts it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::handle::Handle;
use crate::object::{Lifecycle, NodeCore, Object};
use crate::sync::{Arc, Mutex, Weak};

/// Outcome of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MsgResult {
    #[default]
    Unset,
    Rejected,
    Accepted,
    /// Not handled by this hook; processing falls through to the next one.
    Ignored,
    /// The handler keeps the message and replies later.
    Postponed,
    TimedOut,
    Canceled,
}

impl MsgResult {
    pub fn from_bool(ok: bool) -> Self {
        if ok {
            Self::Accepted
        } else {
            Self::Rejected
        }
    }

    /// Integer form used on external interfaces.
    pub fn code(self) -> i64 {
        match self {
            Self::Rejected => 0,
            Self::Accepted => 1,
            Self::TimedOut => 2,
            Self::Ignored => -1,
            Self::Postponed => -2,
            Self::Unset => -3,
            Self::Canceled => -4,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Rejected,
            1 => Self::Accepted,
            2 => Self::TimedOut,
            -1 => Self::Ignored,
            -2 => Self::Postponed,
            -4 => Self::Canceled,
            _ => Self::Unset,
        }
    }

    /// True for results that end a message's processing.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Unset | Self::Ignored | Self::Postponed)
    }
}

impl fmt::Display for MsgResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Typed message parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    Handle(Handle),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Double(v) => Some(*v as i64),
            Self::Bool(v) => Some(i64::from(*v)),
            Self::Str(s) => s.trim().parse().ok(),
            Self::Handle(_) => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::Str(s) => s.trim().parse().ok(),
            Self::Handle(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Int(v) => Some(*v != 0),
            Self::Double(v) => Some(*v != 0.0),
            Self::Str(s) => match s.trim() {
                "true" | "TRUE" | "1" => Some(true),
                "false" | "FALSE" | "0" => Some(false),
                _ => None,
            },
            Self::Handle(h) => Some(!h.is_null()),
        }
    }

    pub fn as_str(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Int(v) => v.to_string(),
            Self::Double(v) => v.to_string(),
            Self::Bool(v) => v.to_string(),
            Self::Handle(h) => h.name(),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Handle> for Value {
    fn from(v: Handle) -> Self {
        Self::Handle(v)
    }
}

/// Completion flag shared between a synchronous caller and the reply path.
#[derive(Debug, Clone, Default)]
pub struct ReadyFlag(Arc<AtomicBool>);

impl ReadyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn same(&self, other: &ReadyFlag) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Anything that can take a replied message back.
pub trait ReplySink: Send + Sync {
    /// Returns false when the sink can no longer accept replies, in which
    /// case the next caller down the stack is tried.
    fn accept_reply(&self, msg: Message, ready: Option<&ReadyFlag>) -> bool;
}

struct Caller {
    sink: Weak<dyn ReplySink>,
    ready: Option<ReadyFlag>,
}

impl Caller {
    fn is(&self, sink: &dyn ReplySink) -> bool {
        Weak::as_ptr(&self.sink) as *const () == sink as *const dyn ReplySink as *const ()
    }
}

#[derive(Default)]
struct MessageState {
    id: u64,
    params: BTreeMap<String, Value>,
    result: MsgResult,
    callers: Vec<Caller>,
    keep_alive: bool,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    canceled: bool,
}

/// Storage behind a [`Message`].
pub struct MessageBody {
    core: NodeCore,
    state: Mutex<MessageState>,
}

impl Object for MessageBody {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn class_name(&self) -> &'static str {
        "Message"
    }

    fn object_cleanup(&self) {
        let (params, callers) = {
            let mut st = self.state.lock();
            (
                std::mem::take(&mut st.params),
                std::mem::take(&mut st.callers),
            )
        };
        drop(params);
        drop(callers);
    }
}

/// Shared reference on a message. Clones refer to the same message.
#[derive(Clone)]
pub struct Message(Handle<MessageBody>);

impl Message {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Handle::new(MessageBody {
            core: NodeCore::new(name),
            state: Mutex::new(MessageState::default()),
        }))
    }

    fn body(&self) -> &MessageBody {
        match self.0.get() {
            Some(body) => body,
            None => unreachable!("message handle is never empty"),
        }
    }

    fn state(&self) -> crate::sync::MutexGuard<'_, MessageState> {
        self.body().state.lock()
    }

    pub fn name(&self) -> String {
        self.body().core.name()
    }

    pub fn is_name(&self, name: &str) -> bool {
        self.body().core.is_name(name)
    }

    /// Id assigned by the receiving unit at submission, 0 before that.
    pub fn id(&self) -> u64 {
        self.state().id
    }

    pub(crate) fn set_id(&self, id: u64) {
        self.state().id = id;
    }

    pub fn ptr_eq(&self, other: &Message) -> bool {
        self.0.ptr_eq(&other.0)
    }

    /// Erased handle on the message node.
    pub fn handle(&self) -> Handle {
        self.0.clone().erase()
    }

    /// Builder-style parameter setter.
    pub fn with(self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) {
        self.state().params.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.state().params.get(name).cloned()
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.state().params.contains_key(name)
    }

    pub fn remove_param(&self, name: &str) -> Option<Value> {
        self.state().params.remove(name)
    }

    pub fn param_names(&self) -> Vec<String> {
        self.state().params.keys().cloned().collect()
    }

    pub fn get_str(&self, name: &str, default: &str) -> String {
        self.get(name)
            .map(|v| v.as_str())
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_int(&self, name: &str, default: i64) -> i64 {
        self.get(name).and_then(|v| v.as_int()).unwrap_or(default)
    }

    pub fn get_double(&self, name: &str, default: f64) -> f64 {
        self.get(name).and_then(|v| v.as_double()).unwrap_or(default)
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        self.get(name).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn get_handle(&self, name: &str) -> Handle {
        match self.get(name) {
            Some(Value::Handle(h)) => h,
            _ => Handle::null(),
        }
    }

    /// Copies parameters of `other`, replacing existing ones only when
    /// `overwrite` is set.
    pub fn merge_from(&self, other: &Message, overwrite: bool) {
        if self.ptr_eq(other) {
            return;
        }
        let src = other.state().params.clone();
        let mut st = self.state();
        for (name, value) in src {
            if overwrite || !st.params.contains_key(&name) {
                st.params.insert(name, value);
            }
        }
    }

    pub fn result(&self) -> MsgResult {
        self.state().result
    }

    pub fn set_result(&self, res: MsgResult) {
        self.state().result = res;
    }

    pub fn is_accepted(&self) -> bool {
        self.result() == MsgResult::Accepted
    }

    pub fn keep_alive(&self) -> bool {
        self.state().keep_alive
    }

    pub fn set_keep_alive(&self, on: bool) {
        self.state().keep_alive = on;
    }

    /// Arms the deadline `tmout` from now; `None` clears it.
    pub fn set_timeout(&self, tmout: Option<Duration>) {
        let mut st = self.state();
        st.timeout = tmout;
        st.deadline = tmout.map(|d| Instant::now() + d);
    }

    pub fn with_timeout(self, tmout: Duration) -> Self {
        self.set_timeout(Some(tmout));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.state().timeout
    }

    /// Time left until the deadline, zero once it has passed.
    pub fn time_till_timeout(&self) -> Option<Duration> {
        self.state()
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_timed_out(&self) -> bool {
        self.time_till_timeout() == Some(Duration::ZERO)
    }

    /// Marks the message canceled. A canceled message reaching dispatch is
    /// replied [`MsgResult::Canceled`] without being executed.
    pub fn cancel(&self) {
        self.state().canceled = true;
    }

    pub fn is_canceled(&self) -> bool {
        self.state().canceled
    }

    /// Pushes a reply recipient on top of the caller stack.
    pub fn add_caller(&self, sink: Weak<dyn ReplySink>, ready: Option<ReadyFlag>) {
        self.state().callers.push(Caller { sink, ready });
    }

    /// Removes every caller entry of `sink`.
    pub fn remove_caller(&self, sink: &dyn ReplySink) {
        self.state().callers.retain(|c| !c.is(sink));
    }

    pub(crate) fn remove_ready_caller(&self, ready: &ReadyFlag) {
        self.state()
            .callers
            .retain(|c| c.ready.as_ref().map_or(true, |r| !r.same(ready)));
    }

    pub fn has_callers(&self) -> bool {
        !self.state().callers.is_empty()
    }

    /// True when the top caller is waiting synchronously for this reply.
    pub fn is_last_caller_sync(&self) -> bool {
        self.state()
            .callers
            .last()
            .map_or(false, |c| c.ready.is_some())
    }

    /// Stores `res` and delivers the message to the topmost live caller.
    ///
    /// Returns false when nobody took the reply. Without keep-alive such a
    /// message is torn down, dropping its parameters.
    pub fn reply(&self, res: MsgResult) -> bool {
        if res != MsgResult::Unset {
            self.set_result(res);
        }
        let mut had_callers = false;
        loop {
            let caller = self.state().callers.pop();
            let Some(caller) = caller else {
                break;
            };
            had_callers = true;
            let Some(sink) = caller.sink.upgrade() else {
                continue;
            };
            if sink.accept_reply(self.clone(), caller.ready.as_ref()) {
                return true;
            }
        }
        if had_callers {
            log::warn!("{}: reply {:?} without recipient", self.name(), self.result());
        } else {
            log::trace!("{}: reply {:?} to nobody", self.name(), self.result());
        }
        if !self.keep_alive() {
            if let Some(body) = self.0.get() {
                body.request_destroy();
            }
        }
        false
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state();
        f.debug_struct("Message")
            .field("name", &self.body().core.name())
            .field("id", &st.id)
            .field("result", &st.result)
            .field("params", &st.params.len())
            .finish()
    }
}
