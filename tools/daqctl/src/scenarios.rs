//! Kernel scenarios runnable from the command line.
//!
//! Every scenario builds its own loops from the given [`LoopConfig`], runs
//! to completion and reports whether the kernel behaved as expected.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use daqk::sync::{Arc, Mutex};
use daqk::{
    AggregateMessage, AggregateMode, EventLoop, EventLoopBuilder, Handle, LoopConfig, Message,
    MessageReceiver, MsgResult, Node, NodeCore, NodeState, Object, Priority, TraceHook, Unit,
    UnitBehavior, UnitContext, UnitRef, UnitRunnable,
};
use serde::Serialize;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

#[derive(Debug, Clone)]
pub enum Scenario {
    /// Strict priority between queues, FIFO within one queue.
    Priority,
    /// Synchronous execute from one loop against a unit on another that
    /// never replies.
    Timeout { tmout: Duration },
    /// Aggregate over three receivers; names in `reject` are refused.
    Aggregate {
        mode: AggregateMode,
        reject: Vec<String>,
    },
    /// Reference counted teardown of nodes and units.
    Lifecycle,
    /// Concurrent add/remove on one child list while it is scanned.
    Stress { rounds: usize },
}

impl Scenario {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Priority => "priority",
            Self::Timeout { .. } => "timeout",
            Self::Aggregate { .. } => "aggregate",
            Self::Lifecycle => "lifecycle",
            Self::Stress { .. } => "stress",
        }
    }

    pub fn run(&self, config: &LoopConfig, hook: Option<TraceHook>) -> Result<Outcome> {
        let mut outcome = Outcome::new(self.name());
        match self {
            Self::Priority => priority(config, hook, &mut outcome)?,
            Self::Timeout { tmout } => timeout(config, hook, *tmout, &mut outcome)?,
            Self::Aggregate { mode, reject } => {
                aggregate(config, hook, *mode, reject, &mut outcome)?
            }
            Self::Lifecycle => lifecycle(config, hook, &mut outcome)?,
            Self::Stress { rounds } => stress(*rounds, &mut outcome)?,
        }
        Ok(outcome)
    }
}

/// Result of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub scenario: &'static str,
    pub passed: bool,
    pub details: Vec<String>,
}

impl Outcome {
    fn new(scenario: &'static str) -> Self {
        Self {
            scenario,
            passed: true,
            details: Vec::new(),
        }
    }

    fn check(&mut self, ok: bool, detail: impl Into<String>) {
        let detail = detail.into();
        if !ok {
            log::error!("{}: {detail}", self.scenario);
            self.passed = false;
        }
        self.details.push(format!("{} {detail}", if ok { "ok  " } else { "FAIL" }));
    }
}

fn build_loop(config: &LoopConfig, suffix: &str, hook: &Option<TraceHook>) -> EventLoop {
    let mut config = config.clone();
    if !suffix.is_empty() {
        config.name = format!("{}-{suffix}", config.name);
    }
    let builder = EventLoopBuilder::new(config);
    match hook {
        Some(hook) => builder.with_trace_hook(hook.clone()).build(),
        None => builder.build(),
    }
}

/// Records executed message names; refuses the configured ones and holds
/// `Hold*` messages without replying.
#[derive(Clone, Default)]
struct Collector {
    seen: Arc<Mutex<Vec<String>>>,
    held: Arc<Mutex<Vec<Message>>>,
    reject: Arc<HashSet<String>>,
}

impl Collector {
    fn rejecting(names: &[String]) -> Self {
        Self {
            reject: Arc::new(names.iter().cloned().collect()),
            ..Default::default()
        }
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

impl UnitBehavior for Collector {
    fn execute_message(&mut self, _ctx: &UnitContext<'_>, msg: &Message) -> MsgResult {
        let name = msg.name();
        if name.starts_with("Hold") {
            self.held.lock().push(msg.clone());
            return MsgResult::Postponed;
        }
        self.seen.lock().push(name.clone());
        MsgResult::from_bool(!self.reject.contains(&name))
    }
}

fn priority(config: &LoopConfig, hook: Option<TraceHook>, out: &mut Outcome) -> Result<()> {
    let lp = build_loop(config, "", &hook);
    let collector = Collector::default();
    let unit = Unit::new("Sorter", collector.clone());
    lp.attach(&unit.unit_ref())?;
    let Some(u) = unit.get() else {
        bail!("sorter unit vanished");
    };

    u.submit_with(Message::new("B1"), Priority::Level(1));
    u.submit_with(Message::new("C"), Priority::Minimum);
    u.submit_with(Message::new("A"), Priority::Level(0));
    u.submit_with(Message::new("B2"), Priority::Level(1));

    lp.start_in_current_thread()?;
    lp.run_event_loop(Duration::from_millis(50))?;
    lp.stop()?;

    let seen = collector.seen();
    out.check(
        seen == ["A", "B1", "B2", "C"],
        format!("dispatch order {}", seen.join(" ")),
    );
    Ok(())
}

struct Caller {
    target: UnitRef,
    tmout: Duration,
    outcome: Arc<Mutex<Option<(MsgResult, Duration)>>>,
}

impl UnitBehavior for Caller {
    fn execute_message(&mut self, _ctx: &UnitContext<'_>, _msg: &Message) -> MsgResult {
        let start = Instant::now();
        let res = self.target.execute(Message::new("Hold"), Some(self.tmout));
        *self.outcome.lock() = Some((res, start.elapsed()));
        MsgResult::Accepted
    }
}

fn timeout(
    config: &LoopConfig,
    hook: Option<TraceHook>,
    tmout: Duration,
    out: &mut Outcome,
) -> Result<()> {
    let l1 = build_loop(config, "1", &hook);
    let l2 = build_loop(config, "2", &hook);
    l1.start(WAIT)?;
    l2.start(WAIT)?;

    let collector = Collector::default();
    let target = Unit::new("P", collector.clone());
    l1.attach(&target.unit_ref())?;

    let result = Arc::new(Mutex::new(None));
    let caller = Unit::new(
        "Q",
        Caller {
            target: target.unit_ref(),
            tmout,
            outcome: result.clone(),
        },
    );
    l2.attach(&caller.unit_ref())?;

    let res = caller.execute(Message::new("Go"), Some(tmout + Duration::from_secs(5)));
    out.check(res == MsgResult::Accepted, format!("caller replied {res}"));

    let Some((res, elapsed)) = result.lock().take() else {
        bail!("caller never ran");
    };
    out.check(res == MsgResult::TimedOut, format!("execute returned {res}"));
    out.check(elapsed >= tmout, format!("gave up after {elapsed:?}"));
    out.check(
        collector.held.lock().len() == 1,
        "target still holds the message",
    );
    let ping = target.execute(Message::new("Ping"), WAIT);
    out.check(ping == MsgResult::Accepted, format!("target still serves ({ping})"));
    Ok(())
}

fn aggregate(
    config: &LoopConfig,
    hook: Option<TraceHook>,
    mode: AggregateMode,
    reject: &[String],
    out: &mut Outcome,
) -> Result<()> {
    let lp = build_loop(config, "", &hook);
    lp.start(WAIT)?;

    let collector = Collector::rejecting(reject);
    let receiver = Unit::new("Receiver", collector.clone()).unit_ref();
    lp.attach(&receiver)?;

    let agg = AggregateMessage::new("Aggregate", mode);
    agg.attach(&lp)?;
    agg.set_default_receiver(&receiver);
    for name in ["R1", "R2", "R3"] {
        agg.add(Message::new(name));
    }

    let res = agg.execute(WAIT);
    let expected = if reject.iter().any(|r| ["R1", "R2", "R3"].contains(&r.as_str())) {
        MsgResult::Rejected
    } else {
        MsgResult::Accepted
    };
    out.check(res == expected, format!("{mode:?} aggregate returned {res}"));
    let entries: Vec<String> = agg.entry_results().iter().map(|r| r.to_string()).collect();
    out.check(true, format!("entries {}", entries.join(" ")));
    out.check(true, format!("executed {}", collector.seen().join(" ")));
    Ok(())
}

struct Probe {
    core: NodeCore,
    cleaned: Arc<AtomicBool>,
}

impl Object for Probe {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn object_cleanup(&self) {
        self.cleaned.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct CleanupProbe {
    thread: Arc<Mutex<Option<String>>>,
}

impl UnitBehavior for CleanupProbe {
    fn cleanup(&mut self, _ctx: &UnitContext<'_>) {
        *self.thread.lock() = thread::current().name().map(str::to_string);
    }
}

fn lifecycle(config: &LoopConfig, hook: Option<TraceHook>, out: &mut Outcome) -> Result<()> {
    let cleaned = Arc::new(AtomicBool::new(false));
    let mut h1 = Handle::new(Probe {
        core: NodeCore::new("O"),
        cleaned: cleaned.clone(),
    });
    let mut h2 = h1.clone();
    h1.release();
    out.check(
        h2.core().map(NodeCore::state) == Some(NodeState::Normal) && !cleaned.load(Ordering::SeqCst),
        "first release keeps the object",
    );
    h2.release();
    out.check(cleaned.load(Ordering::SeqCst), "last release destroys the object");

    let root = Node::create("Root");
    let child = Node::create_in(&root, "Child");
    drop(root);
    out.check(
        child.core().map(|c| c.has_parent()) == Some(false),
        "child outlives its released parent",
    );

    let lp = build_loop(config, "", &hook);
    lp.start(WAIT)?;
    let probe = CleanupProbe::default();
    let thread_name = probe.thread.clone();
    let unit = Unit::new("Owned", probe);
    lp.attach(&unit.unit_ref())?;
    drop(unit);

    let start = Instant::now();
    while thread_name.lock().is_none() {
        if start.elapsed() > Duration::from_secs(2) {
            bail!("unit cleanup never ran");
        }
        thread::sleep(Duration::from_millis(1));
    }
    let ran_on = thread_name.lock().clone().unwrap_or_default();
    out.check(
        ran_on == lp.name(),
        format!("unit torn down on thread {ran_on}"),
    );
    Ok(())
}

fn stress(rounds: usize, out: &mut Outcome) -> Result<()> {
    let root = Node::create("Root");
    let done = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..2)
        .map(|w| {
            let root = root.clone();
            thread::spawn(move || {
                let mut failures = 0usize;
                let Some(core) = root.core() else {
                    return rounds;
                };
                for n in 0..rounds {
                    let child = Node::create(format!("w{w}-{n}"));
                    let added = core.add_child(child.clone().erase());
                    let removed = child.get().is_some_and(|c| core.remove_child(c, false));
                    if !(added && removed) {
                        failures += 1;
                    }
                }
                failures
            })
        })
        .collect();

    let reader = {
        let root = root.clone();
        let done = done.clone();
        thread::spawn(move || {
            let (mut scans, mut duplicates) = (0usize, 0usize);
            let Some(core) = root.core() else {
                return (scans, duplicates);
            };
            while !done.load(Ordering::Acquire) {
                let snapshot = core.child_refs();
                let mut names = HashSet::new();
                for child in snapshot.iter() {
                    if !names.insert(child.name()) {
                        duplicates += 1;
                    }
                }
                scans += 1;
            }
            (scans, duplicates)
        })
    };

    let mut failures = 0;
    for writer in writers {
        failures += writer
            .join()
            .map_err(|_| anyhow::anyhow!("writer thread panicked"))?;
    }
    done.store(true, Ordering::Release);
    let (scans, duplicates) = reader
        .join()
        .map_err(|_| anyhow::anyhow!("reader thread panicked"))?;

    out.check(failures == 0, format!("{failures} failed add/remove pairs"));
    out.check(duplicates == 0, format!("{duplicates} duplicates in {scans} scans"));
    let left = root.core().context("root vanished")?.num_children();
    out.check(left == 0, format!("{left} children left"));
    Ok(())
}
