//! Request/response helpers on top of unit submission.
//!
//! [`MessageReceiver`] gives any unit handle a synchronous-looking call
//! surface. How a call blocks depends on the caller: a thread driving an
//! event loop keeps pumping that loop while it waits, any other thread
//! parks on a [`Promise`].

use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::event_loop::LoopInner;
use crate::handle::Handle;
use crate::message::{Message, MsgResult, ReadyFlag, ReplySink};
use crate::sync::{Arc, Weak};
use crate::unit::{Priority, UnitRunnable};

/// Call surface of anything that accepts messages.
pub trait MessageReceiver {
    /// Queues `msg` without waiting for the reply.
    fn submit(&self, msg: Message) -> bool;

    /// Submits `msg` and blocks until it is replied or `tmout` runs out.
    fn execute(&self, msg: Message, tmout: Option<Duration>) -> MsgResult;

    /// Executes `msg` and reads integer parameter `name` from the reply.
    fn execute_int(&self, msg: Message, name: &str, tmout: Option<Duration>) -> Option<i64> {
        msg.set_keep_alive(true);
        match self.execute(msg.clone(), tmout) {
            MsgResult::Accepted => msg.get(name).and_then(|v| v.as_int()),
            _ => None,
        }
    }

    /// Executes `msg` and reads string parameter `name` from the reply.
    fn execute_str(&self, msg: Message, name: &str, tmout: Option<Duration>) -> Option<String> {
        msg.set_keep_alive(true);
        match self.execute(msg.clone(), tmout) {
            MsgResult::Accepted => msg.get(name).map(|v| v.as_str()),
            _ => None,
        }
    }
}

impl<T: ?Sized + UnitRunnable> MessageReceiver for Handle<T> {
    fn submit(&self, msg: Message) -> bool {
        match self.get() {
            Some(unit) => unit.submit_with(msg, Priority::Default),
            None => {
                msg.reply(MsgResult::Rejected);
                false
            }
        }
    }

    fn execute(&self, msg: Message, tmout: Option<Duration>) -> MsgResult {
        match self.get() {
            Some(unit) => execute_on(unit.as_runnable(), msg, Priority::Default, tmout),
            None => MsgResult::Rejected,
        }
    }
}

/// Synchronous execution of `msg` on `unit`.
///
/// A unit executing on itself from inside one of its own hooks would wait
/// for a dispatch that can only run after the hook returns; such calls are
/// rejected immediately.
pub fn execute_on(
    unit: &dyn UnitRunnable,
    msg: Message,
    priority: Priority,
    tmout: Option<Duration>,
) -> MsgResult {
    if unit.shared().is_busy_on_current_thread() {
        log::warn!(
            "{}: synchronous {} from its own hook rejected",
            unit.core().name(),
            msg.name()
        );
        msg.reply(MsgResult::Rejected);
        return MsgResult::Rejected;
    }
    match LoopInner::current() {
        Some(lp) => lp.execute_pumping(unit, msg, priority, tmout),
        None => Promise::submit(unit, msg, priority).wait(tmout),
    }
}

/// Sink delivering replies into a crossbeam channel.
pub struct ReplyChannel {
    tx: Sender<Message>,
}

impl ReplyChannel {
    pub fn new() -> (Arc<Self>, Receiver<Message>) {
        let (tx, rx) = unbounded();
        (Arc::new(Self { tx }), rx)
    }
}

impl ReplySink for ReplyChannel {
    fn accept_reply(&self, msg: Message, ready: Option<&ReadyFlag>) -> bool {
        if let Some(ready) = ready {
            ready.set();
        }
        self.tx.send(msg).is_ok()
    }
}

fn sink_of(channel: &Arc<ReplyChannel>) -> Weak<dyn ReplySink> {
    let weak: Weak<ReplyChannel> = Arc::downgrade(channel);
    weak
}

/// Pending outcome of one submitted message.
pub struct Promise {
    msg: Message,
    sink: Arc<ReplyChannel>,
    rx: Receiver<Message>,
}

impl Promise {
    pub fn submit(unit: &dyn UnitRunnable, msg: Message, priority: Priority) -> Self {
        let (sink, rx) = ReplyChannel::new();
        msg.add_caller(sink_of(&sink), None);
        unit.submit_with(msg.clone(), priority);
        Self { msg, sink, rx }
    }

    pub fn message(&self) -> &Message {
        &self.msg
    }

    /// Result if the reply already arrived.
    pub fn try_result(&self) -> Option<MsgResult> {
        self.rx.try_recv().ok().map(|m| m.result())
    }

    /// Blocks for the reply. On timeout the promise withdraws from the
    /// message and reports [`MsgResult::TimedOut`]; the receiver keeps it.
    pub fn wait(self, tmout: Option<Duration>) -> MsgResult {
        let got = match tmout {
            Some(t) => self.rx.recv_timeout(t).ok(),
            None => self.rx.recv().ok(),
        };
        match got {
            Some(msg) => msg.result(),
            None => {
                self.msg.remove_caller(&*self.sink);
                log::debug!("{}: no reply within {tmout:?}", self.msg.name());
                MsgResult::TimedOut
            }
        }
    }
}

/// Waits for the replies of a group of messages.
///
/// Meant for threads that do not run an event loop.
pub struct MessageClient {
    sink: Arc<ReplyChannel>,
    rx: Receiver<Message>,
    pending: Vec<Message>,
    replied: Vec<Message>,
    keep_replied: bool,
}

impl Default for MessageClient {
    fn default() -> Self {
        Self::new(false)
    }
}

impl MessageClient {
    /// With `keep_replied`, replied messages are retained for inspection.
    pub fn new(keep_replied: bool) -> Self {
        let (sink, rx) = ReplyChannel::new();
        Self {
            sink,
            rx,
            pending: Vec::new(),
            replied: Vec::new(),
            keep_replied,
        }
    }

    /// Makes this client the recipient of `msg`'s reply.
    pub fn assign(&mut self, msg: &Message) {
        msg.add_caller(sink_of(&self.sink), None);
        self.pending.push(msg.clone());
    }

    pub fn submit(&mut self, target: &impl MessageReceiver, msg: Message) -> bool {
        self.assign(&msg);
        target.submit(msg)
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn replied(&self) -> &[Message] {
        &self.replied
    }

    pub fn take_replied(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.replied)
    }

    /// Waits until every assigned message is replied. Returns true when all
    /// of them were accepted. Messages still pending at the timeout are
    /// canceled.
    pub fn wait_all(&mut self, tmout: Option<Duration>) -> bool {
        let start = Instant::now();
        let mut all_ok = true;
        while !self.pending.is_empty() {
            let got = match tmout {
                Some(t) => {
                    let left = t.saturating_sub(start.elapsed());
                    self.rx.recv_timeout(left)
                }
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match got {
                Ok(msg) => {
                    let Some(pos) = self.pending.iter().position(|m| m.ptr_eq(&msg)) else {
                        continue;
                    };
                    self.pending.remove(pos);
                    all_ok &= msg.is_accepted();
                    if self.keep_replied {
                        self.replied.push(msg);
                    }
                }
                Err(_) => {
                    self.cancel_pending();
                    return false;
                }
            }
        }
        all_ok
    }

    fn cancel_pending(&mut self) {
        for msg in self.pending.drain(..) {
            log::debug!("{}: canceled after client timeout", msg.name());
            msg.cancel();
            msg.remove_caller(&*self.sink);
        }
    }
}

impl Drop for MessageClient {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}
