use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::aggregate::{AggregateMessage, AggregateMode};
use crate::client::ReplyChannel;
use crate::config::LoopConfig;
use crate::event_loop::EventLoop;
use crate::message::{Message, MsgResult, ReplySink};
use crate::sync::Weak;
use crate::unit::{Unit, UnitBehavior, UnitContext, UnitRef};

use super::{init_logger, wait_for, Recorder, WAIT};

struct Fixture {
    lp: EventLoop,
    recorder: Recorder,
    receiver: UnitRef,
}

fn fixture(name: &str) -> Fixture {
    init_logger();
    let lp = EventLoop::new(LoopConfig::builder().name(name).build());
    lp.start(WAIT).unwrap();
    let recorder = Recorder::default();
    let receiver = Unit::new("Receiver", recorder.clone()).unit_ref();
    lp.attach(&receiver).unwrap();
    Fixture {
        lp,
        recorder,
        receiver,
    }
}

fn aggregate(f: &Fixture, mode: AggregateMode, names: &[&str]) -> AggregateMessage {
    let agg = AggregateMessage::new("Aggregate", mode);
    agg.attach(&f.lp).unwrap();
    agg.set_default_receiver(&f.receiver);
    for name in names {
        assert!(agg.add(Message::new(*name)));
    }
    agg
}

#[test]
fn parallel_all_accepted() {
    let f = fixture("agg-ok");
    let agg = aggregate(&f, AggregateMode::Parallel, &["R1", "R2", "R3"]);

    assert_eq!(agg.execute(WAIT), MsgResult::Accepted);
    assert!(agg.is_completed());
    assert_eq!(agg.result(), MsgResult::Accepted);
    assert_eq!(agg.entry_results(), vec![MsgResult::Accepted; 3]);
    assert_eq!(f.recorder.seen().len(), 3);
}

#[test]
fn parallel_one_rejected() {
    let f = fixture("agg-rej");
    let agg = aggregate(&f, AggregateMode::Parallel, &["R1", "Reject2", "R3"]);

    assert_eq!(agg.execute(WAIT), MsgResult::Rejected);
    assert_eq!(agg.result(), MsgResult::Rejected);
    assert!(agg.entry_results().contains(&MsgResult::Rejected));
}

#[test]
fn sequential_submits_in_order_and_stops_on_failure() {
    let f = fixture("agg-seq");
    let agg = aggregate(&f, AggregateMode::Sequential, &["S1", "Reject2", "S3"]);

    assert_eq!(agg.execute(WAIT), MsgResult::Rejected);
    assert_eq!(f.recorder.seen(), vec!["S1", "Reject2"]);
    assert_eq!(
        agg.entry_results(),
        vec![MsgResult::Accepted, MsgResult::Rejected, MsgResult::Unset]
    );
}

#[test]
fn empty_aggregate_is_accepted() {
    let f = fixture("agg-empty");
    let agg = aggregate(&f, AggregateMode::Parallel, &[]);
    assert_eq!(agg.execute(WAIT), MsgResult::Accepted);
}

#[test]
fn timeout_rejects_and_cancels_the_rest() {
    let f = fixture("agg-tmout");
    let agg = aggregate(&f, AggregateMode::Parallel, &["Fast", "PostponeSlow"]);

    let start = Instant::now();
    assert_eq!(agg.execute(Some(Duration::from_millis(100))), MsgResult::Rejected);
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(
        agg.entry_results(),
        vec![MsgResult::Accepted, MsgResult::Canceled]
    );
    let held = f.recorder.held.lock().unwrap();
    assert!(held[0].is_canceled());
    assert!(!held[0].has_callers());
}

#[test]
fn entry_receiver_overrides_default() {
    let f = fixture("agg-route");
    let other = Recorder::default();
    let other_unit = Unit::new("Other", other.clone()).unit_ref();
    f.lp.attach(&other_unit).unwrap();

    let agg = aggregate(&f, AggregateMode::Parallel, &["ToDefault"]);
    assert!(agg.add_to(Message::new("ToOther"), &other_unit));
    assert_eq!(agg.num_entries(), 2);

    assert_eq!(agg.execute(WAIT), MsgResult::Accepted);
    assert_eq!(f.recorder.seen(), vec!["ToDefault"]);
    assert_eq!(other.seen(), vec!["ToOther"]);
}

#[test]
fn async_run_replies_main_message() {
    let f = fixture("agg-async");
    let agg = aggregate(&f, AggregateMode::Sequential, &["A1", "A2"]);
    let (sink, rx) = ReplyChannel::new();
    let weak: Weak<ReplyChannel> = Arc::downgrade(&sink);
    let weak: Weak<dyn ReplySink> = weak;
    let main = Message::new("Main");
    main.add_caller(weak, None);

    assert!(agg.submit(Some(main.clone()), None));
    let replied = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(replied.ptr_eq(&main));
    assert_eq!(main.result(), MsgResult::Accepted);
}

#[derive(Default)]
struct Stuck {
    held: Arc<Mutex<Vec<Message>>>,
}

impl UnitBehavior for Stuck {
    fn execute_message(&mut self, _ctx: &UnitContext<'_>, msg: &Message) -> MsgResult {
        self.held.lock().unwrap().push(msg.clone());
        MsgResult::Postponed
    }
}

#[test]
fn reset_cancels_running_aggregate() {
    let f = fixture("agg-reset");
    let stuck = Stuck::default();
    let held = stuck.held.clone();
    let stuck_unit = Unit::new("Stuck", stuck).unit_ref();
    f.lp.attach(&stuck_unit).unwrap();

    let agg = AggregateMessage::new("Resettable", AggregateMode::Parallel);
    agg.attach(&f.lp).unwrap();
    agg.set_default_receiver(&stuck_unit);
    agg.add(Message::new("X"));
    agg.add(Message::new("Y"));

    let (sink, rx) = ReplyChannel::new();
    let weak: Weak<ReplyChannel> = Arc::downgrade(&sink);
    let main = Message::new("Main");
    main.add_caller(weak, None);
    assert!(agg.submit(Some(main.clone()), None));
    assert!(wait_for(|| held.lock().unwrap().len() == 2));
    assert!(!agg.add(Message::new("Late")));

    assert!(agg.reset(MsgResult::Canceled));
    let replied = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(replied.result(), MsgResult::Canceled);
    assert!(wait_for(|| agg.num_entries() == 0));
    assert!(held.lock().unwrap().iter().all(Message::is_canceled));
}
