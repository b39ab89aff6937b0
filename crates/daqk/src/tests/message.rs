use std::time::Duration;

use crate::client::{MessageClient, ReplyChannel};
use crate::message::{Message, MsgResult, ReadyFlag, ReplySink, Value};
use crate::object::{Node, NodeState};
use crate::sync::{Arc, Weak};

use super::{init_logger, warned};

fn sink_of(channel: &Arc<ReplyChannel>) -> Weak<dyn ReplySink> {
    let weak: Weak<ReplyChannel> = Arc::downgrade(channel);
    weak
}

#[test]
fn result_codes_are_stable() {
    let codes = [
        (MsgResult::Rejected, 0),
        (MsgResult::Accepted, 1),
        (MsgResult::TimedOut, 2),
        (MsgResult::Ignored, -1),
        (MsgResult::Postponed, -2),
        (MsgResult::Unset, -3),
        (MsgResult::Canceled, -4),
    ];
    for (res, code) in codes {
        assert_eq!(res.code(), code);
        assert_eq!(MsgResult::from_code(code), res);
    }
    assert_eq!(MsgResult::from_bool(true), MsgResult::Accepted);
    assert!(!MsgResult::Postponed.is_terminal());
    assert!(MsgResult::Canceled.is_terminal());
}

#[test]
fn typed_parameters_convert() {
    let msg = Message::new("Configure")
        .with("count", 12)
        .with("ratio", 0.5)
        .with("enabled", "true")
        .with("label", "adc");

    assert_eq!(msg.get_int("count", 0), 12);
    assert_eq!(msg.get_double("count", 0.0), 12.0);
    assert_eq!(msg.get_double("ratio", 0.0), 0.5);
    assert!(msg.get_bool("enabled", false));
    assert_eq!(msg.get_str("label", ""), "adc");
    assert_eq!(msg.get_int("missing", -7), -7);
    assert!(msg.get_handle("label").is_null());

    assert!(msg.has_param("label"));
    assert_eq!(msg.remove_param("label"), Some(Value::Str("adc".into())));
    assert!(!msg.has_param("label"));
    assert_eq!(msg.param_names(), vec!["count", "enabled", "ratio"]);
}

#[test]
fn handle_parameters_keep_references() {
    let node = Node::create("buffer");
    let msg = Message::new("Attach").with("node", node.clone().erase());
    assert_eq!(node.num_references(), 2);
    assert!(msg.get_handle("node").ptr_eq(&node));
    drop(msg);
    assert_eq!(node.num_references(), 1);
}

#[test]
fn merge_respects_overwrite() {
    let base = Message::new("Base").with("a", 1).with("b", 2);
    let extra = Message::new("Extra").with("b", 20).with("c", 30);

    base.merge_from(&extra, false);
    assert_eq!(base.get_int("b", 0), 2);
    assert_eq!(base.get_int("c", 0), 30);

    base.merge_from(&extra, true);
    assert_eq!(base.get_int("b", 0), 20);
}

#[test]
fn reply_goes_to_topmost_live_caller() {
    init_logger();
    let (first, first_rx) = ReplyChannel::new();
    let (second, second_rx) = ReplyChannel::new();
    let msg = Message::new("Read");
    msg.add_caller(sink_of(&first), None);
    msg.add_caller(sink_of(&second), None);

    assert!(msg.reply(MsgResult::Accepted));
    assert!(second_rx.try_recv().unwrap().ptr_eq(&msg));
    assert!(first_rx.try_recv().is_err());

    // A vanished caller is skipped.
    drop(second);
    msg.add_caller(sink_of(&first), None);
    assert!(msg.reply(MsgResult::Rejected));
    assert_eq!(first_rx.try_recv().unwrap().result(), MsgResult::Rejected);
}

#[test]
fn reply_without_recipient_tears_message_down() {
    init_logger();
    let msg = Message::new("Orphan").with("x", 1);
    assert!(!msg.reply(MsgResult::Accepted));
    assert_eq!(
        msg.handle().core().map(|c| c.state()),
        Some(NodeState::WaitingForFinalRelease)
    );
    assert_eq!(msg.get("x"), None);
    assert_eq!(msg.result(), MsgResult::Accepted);

    let kept = Message::new("Kept").with("x", 1);
    kept.set_keep_alive(true);
    assert!(!kept.reply(MsgResult::Accepted));
    assert_eq!(kept.get_int("x", 0), 1);
}

#[test]
fn reply_lost_by_vanished_caller_is_warned() {
    init_logger();
    let (sink, _rx) = ReplyChannel::new();
    let msg = Message::new("Abandoned");
    msg.add_caller(sink_of(&sink), None);
    drop(sink);

    assert!(!msg.reply(MsgResult::Accepted));
    assert!(warned("Abandoned: reply Accepted without recipient"));

    assert!(!Message::new("Unwatched").reply(MsgResult::Accepted));
    assert!(!warned("Unwatched"));
}

#[test]
fn ready_callers_are_flagged_and_removable() {
    let (sink, rx) = ReplyChannel::new();
    let ready = ReadyFlag::new();
    let msg = Message::new("Sync");
    msg.add_caller(sink_of(&sink), Some(ready.clone()));
    assert!(msg.is_last_caller_sync());

    msg.remove_ready_caller(&ready);
    assert!(!msg.has_callers());

    msg.add_caller(sink_of(&sink), Some(ready.clone()));
    msg.reply(MsgResult::Accepted);
    assert!(ready.is_set());
    assert!(rx.try_recv().is_ok());
}

#[test]
fn timeout_counts_down() {
    let msg = Message::new("Slow").with_timeout(Duration::from_millis(20));
    assert_eq!(msg.timeout(), Some(Duration::from_millis(20)));
    assert!(!msg.is_timed_out());
    std::thread::sleep(Duration::from_millis(30));
    assert!(msg.is_timed_out());
    assert_eq!(msg.time_till_timeout(), Some(Duration::ZERO));

    msg.set_timeout(None);
    assert_eq!(msg.time_till_timeout(), None);
}

#[test]
fn client_collects_replies() {
    init_logger();
    let mut client = MessageClient::new(true);
    let a = Message::new("A");
    let b = Message::new("B");
    client.assign(&a);
    client.assign(&b);
    assert_eq!(client.num_pending(), 2);

    let replier = {
        let (a, b) = (a.clone(), b.clone());
        std::thread::spawn(move || {
            a.reply(MsgResult::Accepted);
            b.reply(MsgResult::Accepted);
        })
    };
    assert!(client.wait_all(Some(Duration::from_secs(2))));
    replier.join().unwrap();
    assert_eq!(client.replied().len(), 2);
    assert_eq!(client.take_replied().len(), 2);
}

#[test]
fn client_cancels_on_timeout() {
    init_logger();
    let mut client = MessageClient::new(false);
    let msg = Message::new("Never");
    client.assign(&msg);
    assert!(!client.wait_all(Some(Duration::from_millis(20))));
    assert!(msg.is_canceled());
    assert!(!msg.has_callers());
    assert_eq!(client.num_pending(), 0);
    assert_eq!(msg.handle().core().map(|c| c.state()), Some(NodeState::Normal));
}
