use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::{MessageReceiver, Promise};
use crate::config::{LoopConfig, UnitConfig};
use crate::error::{KernelError, LoopExit};
use crate::event_loop::{EventLoop, LoopState};
use crate::message::{Message, MsgResult};
use crate::object::{Node, NodeFlags, NodeState, Object};
use crate::trace::TraceRecord;
use crate::unit::{Priority, Unit, UnitBehavior, UnitContext, UnitRef, UnitRunnable};

use super::{init_logger, wait_for, Recorder, WAIT};

fn config(name: &str) -> LoopConfig {
    LoopConfig::builder()
        .name(name)
        .stop_timeout(Duration::from_secs(2))
        .build()
}

#[test]
fn strict_priority_then_fifo() {
    init_logger();
    let lp = EventLoop::new(config("prio"));
    let recorder = Recorder::default();
    let unit = Unit::new("Sorter", recorder.clone());
    lp.attach(&unit.unit_ref()).unwrap();
    let u = unit.get().unwrap();

    u.submit_with(Message::new("B1"), Priority::Level(1));
    u.submit_with(Message::new("C"), Priority::Minimum);
    u.submit_with(Message::new("A"), Priority::Level(0));
    u.submit_with(Message::new("B2"), Priority::Level(1));

    lp.start_in_current_thread().unwrap();
    assert!(lp.is_current_thread());
    lp.run_event_loop(Duration::from_millis(50)).unwrap();
    assert_eq!(recorder.seen(), vec!["A", "B1", "B2", "C"]);

    lp.stop().unwrap();
    assert_eq!(lp.state(), LoopState::Stopped);
}

#[test]
fn run_event_loop_refuses_foreign_thread() {
    init_logger();
    let lp = EventLoop::new(config("foreign"));
    lp.start(WAIT).unwrap();
    assert!(matches!(
        lp.run_event_loop(Duration::from_millis(10)),
        Err(KernelError::WrongThread(name)) if name == "foreign"
    ));
    lp.stop().unwrap();
}

#[test]
fn start_and_stop_lifecycle() {
    init_logger();
    let lp = EventLoop::new(config("life"));
    assert_eq!(lp.state(), LoopState::Created);
    assert!(lp.sync(WAIT).is_err());

    lp.start(WAIT).unwrap();
    assert_eq!(lp.state(), LoopState::Running);
    assert!(!lp.is_current_thread());
    lp.sync(WAIT).unwrap();

    lp.stop().unwrap();
    assert_eq!(lp.state(), LoopState::Joined);

    // A stopped loop refuses work but can be restarted.
    let unit = Unit::new("Late", Recorder::default());
    lp.attach(&unit.unit_ref()).unwrap();
    assert!(!unit.submit(Message::new("Dropped")));
    lp.start(WAIT).unwrap();
    assert_eq!(unit.execute(Message::new("Ping"), WAIT), MsgResult::Accepted);
}

#[test]
fn stop_rejects_unprocessed_messages() {
    init_logger();
    let lp = EventLoop::new(config("drain"));
    let unit = Unit::new("Held", Recorder::default());
    lp.attach(&unit.unit_ref()).unwrap();

    lp.start_in_current_thread().unwrap();
    let pending = Promise::submit(unit.get().unwrap(), Message::new("Never"), Priority::Default);
    lp.stop().unwrap();
    assert_eq!(pending.wait(WAIT), MsgResult::Rejected);
}

#[test]
fn attach_twice_fails() {
    init_logger();
    let first = EventLoop::new(config("first"));
    let second = EventLoop::new(config("second"));
    let unit = Unit::new("Single", Recorder::default()).unit_ref();

    let id = first.attach(&unit).unwrap();
    assert!(id > 1);
    assert_eq!(first.num_units(), 1);
    assert!(matches!(
        second.attach(&unit),
        Err(KernelError::AlreadyAttached { .. })
    ));
    assert_eq!(second.num_units(), 0);
    assert!(matches!(
        first.attach(&UnitRef::null()),
        Err(KernelError::NullHandle)
    ));
}

#[test]
fn unit_ids_are_reused_after_halt() {
    init_logger();
    let lp = EventLoop::new(config("ids"));
    let a = Unit::new("A", Recorder::default()).unit_ref();
    let b = Unit::new("B", Recorder::default()).unit_ref();
    let c = Unit::new("C", Recorder::default()).unit_ref();

    let id_a = lp.attach(&a).unwrap();
    let id_b = lp.attach(&b).unwrap();
    assert_ne!(id_a, id_b);

    lp.halt_unit(&a).unwrap();
    assert!(!a.get().unwrap().is_attached());
    assert_eq!(lp.attach(&c).unwrap(), id_a);
}

#[test]
fn halt_waits_for_queued_messages() {
    init_logger();
    let lp = EventLoop::new(config("halt"));
    lp.start(WAIT).unwrap();
    let recorder = Recorder::default();
    let unit = Unit::new("Slowpoke", recorder.clone()).unit_ref();
    lp.attach(&unit).unwrap();

    let promises: Vec<Promise> = (0..5)
        .map(|n| Promise::submit(unit.get().unwrap(), Message::new(format!("M{n}")), Priority::Default))
        .collect();
    lp.halt_unit(&unit).unwrap();

    for promise in promises {
        assert_eq!(promise.wait(WAIT), MsgResult::Accepted);
    }
    assert_eq!(recorder.seen().len(), 5);
    assert!(!unit.submit(Message::new("TooLate")));
}

#[test]
fn magic_priority_bypasses_halting_unit() {
    init_logger();
    let lp = EventLoop::new(config("magic"));
    let recorder = Recorder::default();
    let unit = Unit::new("Closing", recorder.clone()).unit_ref();
    lp.attach(&unit).unwrap();
    let u = unit.get().unwrap();

    u.shared().set_accepting(false);
    assert!(!u.submit_with(Message::new("Regular"), Priority::Maximum));
    assert!(u.submit_with(Message::new("Urgent"), Priority::Magic));

    lp.start(WAIT).unwrap();
    assert!(wait_for(|| recorder.seen() == vec!["Urgent"]));
}

#[derive(Default)]
struct Caller {
    target: UnitRef,
    result: Arc<Mutex<Option<MsgResult>>>,
}

impl UnitBehavior for Caller {
    fn execute_message(&mut self, _ctx: &UnitContext<'_>, msg: &Message) -> MsgResult {
        let inner = Message::new(msg.get_str("inner", "Ping"));
        let res = self.target.execute(inner, Some(Duration::from_millis(300)));
        *self.result.lock().unwrap() = Some(res);
        MsgResult::Accepted
    }
}

#[test]
fn execute_pumps_the_callers_loop() {
    init_logger();
    let l1 = EventLoop::new(config("L1"));
    let l2 = EventLoop::new(config("L2"));
    l1.start(WAIT).unwrap();
    l2.start(WAIT).unwrap();

    let target = Unit::new("Target", Recorder::default()).unit_ref();
    l1.attach(&target).unwrap();
    let caller = Caller {
        target: target.clone(),
        ..Default::default()
    };
    let result = caller.result.clone();
    let caller = Unit::new("Caller", caller).unit_ref();
    l2.attach(&caller).unwrap();

    assert_eq!(caller.execute(Message::new("Go"), WAIT), MsgResult::Accepted);
    assert_eq!(*result.lock().unwrap(), Some(MsgResult::Accepted));

    // A unit on the same loop is served by the pump itself.
    let local = Unit::new("Local", Recorder::default()).unit_ref();
    l2.attach(&local).unwrap();
    let caller2 = Caller {
        target: local.clone(),
        ..Default::default()
    };
    let result2 = caller2.result.clone();
    let caller2 = Unit::new("Caller2", caller2).unit_ref();
    l2.attach(&caller2).unwrap();
    assert_eq!(caller2.execute(Message::new("Go"), WAIT), MsgResult::Accepted);
    assert_eq!(*result2.lock().unwrap(), Some(MsgResult::Accepted));
}

#[test]
fn pump_times_out_and_leaves_target_untouched() {
    init_logger();
    let l1 = EventLoop::new(config("P1"));
    let l2 = EventLoop::new(config("P2"));
    l1.start(WAIT).unwrap();
    l2.start(WAIT).unwrap();

    let recorder = Recorder::default();
    let target = Unit::new("Sink", recorder.clone()).unit_ref();
    l1.attach(&target).unwrap();
    let caller = Caller {
        target: target.clone(),
        ..Default::default()
    };
    let result = caller.result.clone();
    let caller = Unit::new("Impatient", caller).unit_ref();
    l2.attach(&caller).unwrap();

    let msg = Message::new("Go").with("inner", "PostponeForever");
    assert_eq!(caller.execute(msg, WAIT), MsgResult::Accepted);
    assert_eq!(*result.lock().unwrap(), Some(MsgResult::TimedOut));

    assert_eq!(target.execute(Message::new("Ping"), WAIT), MsgResult::Accepted);
    assert_eq!(recorder.held.lock().unwrap().len(), 1);
}

#[test]
fn trace_hook_sees_scheduling() {
    init_logger();
    let records: Arc<crate::sync::Mutex<Vec<TraceRecord>>> = Arc::default();
    let sink = records.clone();
    let lp = EventLoop::builder(config("traced"))
        .with_trace_hook(Arc::new(move |r: &TraceRecord| sink.lock().push(r.clone())))
        .build();
    lp.start(WAIT).unwrap();
    let unit = Unit::new("Observed", Recorder::default()).unit_ref();
    lp.attach(&unit).unwrap();
    assert_eq!(unit.execute(Message::new("Ping"), WAIT), MsgResult::Accepted);
    lp.stop().unwrap();

    let records = records.lock();
    assert!(records.iter().any(|r| matches!(r, TraceRecord::LoopStarted { .. })));
    assert!(records.iter().any(|r| matches!(r, TraceRecord::UnitAttached { unit, .. } if unit == "Observed")));
    assert!(records
        .iter()
        .any(|r| matches!(r, TraceRecord::MessageReplied { message, result, .. } if message == "Ping" && result == "Accepted")));
    assert!(records.iter().any(|r| matches!(r, TraceRecord::Dispatch { unit, .. } if unit == "Observed")));
    assert!(matches!(records.last(), Some(TraceRecord::LoopStopped { .. })));

    let position = |want: &dyn Fn(&TraceRecord) -> bool| records.iter().position(|r| want(r));
    let queued = position(&|r| matches!(r, TraceRecord::MessageSubmitted { message, .. } if message == "Ping"));
    let replied = position(&|r| matches!(r, TraceRecord::MessageReplied { message, .. } if message == "Ping"));
    assert!(queued.unwrap() < replied.unwrap());
}

#[test]
fn refused_submission_is_traced_as_rejected() {
    init_logger();
    let records: Arc<crate::sync::Mutex<Vec<TraceRecord>>> = Arc::default();
    let sink = records.clone();
    let lp = EventLoop::builder(config("refusing"))
        .with_trace_hook(Arc::new(move |r: &TraceRecord| sink.lock().push(r.clone())))
        .build();
    let unit = Unit::new("Refused", Recorder::default()).unit_ref();
    lp.attach(&unit).unwrap();
    lp.start(WAIT).unwrap();
    lp.stop().unwrap();

    assert!(!unit.submit(Message::new("Late")));
    let records = records.lock();
    let n = records.len();
    assert!(matches!(&records[n - 2], TraceRecord::MessageSubmitted { message, .. } if message == "Late"));
    assert!(matches!(&records[n - 1], TraceRecord::MessageReplied { message, result, .. } if message == "Late" && result == "Rejected"));
}

#[test]
fn reaper_defers_final_drop_to_loop() {
    init_logger();
    let lp = EventLoop::new(config("reaper"));
    lp.start(WAIT).unwrap();

    let node = Node::with_flags("buffer", NodeFlags::AUTO_DESTROY);
    node.core().unwrap().set_reaper(lp.reaper());
    let weak = Arc::downgrade(node.arc().unwrap());
    let arc = node.arc().unwrap().clone();

    drop(node);
    assert!(wait_for(|| arc.core().state() == NodeState::Destructing));
    drop(arc);
    assert!(wait_for(|| weak.strong_count() == 0));
}

#[derive(Default)]
struct Looper {
    served: Arc<AtomicUsize>,
    exit: Arc<Mutex<Option<bool>>>,
}

impl UnitBehavior for Looper {
    fn main_loop(&mut self, ctx: &UnitContext<'_>) -> Result<(), LoopExit> {
        loop {
            if let Some(msg) = ctx.wait_message(Duration::from_millis(10))? {
                self.served.fetch_add(1, Ordering::SeqCst);
                msg.reply(MsgResult::Accepted);
            }
        }
    }

    fn after_main_loop(&mut self, _ctx: &UnitContext<'_>) {
        *self.exit.lock().unwrap() = Some(true);
    }
}

#[test]
fn explicit_loop_serves_messages_until_stop() {
    init_logger();
    let lp = EventLoop::new(config("explicit"));
    lp.start(WAIT).unwrap();
    let looper = Looper::default();
    let served = looper.served.clone();
    let exit = looper.exit.clone();
    let unit = Unit::new("Looper", looper).unit_ref();
    lp.attach(&unit).unwrap();
    lp.set_explicit_loop(&unit).unwrap();

    assert_eq!(unit.execute(Message::new("One"), WAIT), MsgResult::Accepted);
    assert_eq!(unit.execute(Message::new("Two"), WAIT), MsgResult::Accepted);
    assert_eq!(served.load(Ordering::SeqCst), 2);

    lp.stop().unwrap();
    assert_eq!(*exit.lock().unwrap(), Some(true));
}

#[test]
fn sleep_serves_current_loop() {
    init_logger();
    let lp = EventLoop::new(config("sleepy"));
    let recorder = Recorder::default();
    let unit = Unit::with_config(
        "Napper",
        UnitConfig::default().with_priority(Priority::Maximum),
        recorder.clone(),
    );
    lp.attach(&unit.unit_ref()).unwrap();
    unit.submit(Message::new("WhileSleeping"));

    lp.start_in_current_thread().unwrap();
    assert!(EventLoop::current().is_some());
    crate::event_loop::sleep(Duration::from_millis(20));
    assert_eq!(recorder.seen(), vec!["WhileSleeping"]);
    lp.stop().unwrap();
    assert!(EventLoop::current().is_none());
}

#[test]
fn drop_detaches_units() {
    init_logger();
    let unit = Unit::new("Orphaned", Recorder::default()).unit_ref();
    {
        let lp = EventLoop::new(config("gone"));
        lp.start(WAIT).unwrap();
        lp.attach(&unit).unwrap();
        assert!(unit.get().unwrap().is_attached());
    }
    assert!(!unit.get().unwrap().is_attached());
    assert!(!unit.submit(Message::new("Nobody")));
}
