use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::message::{Message, MsgResult};
use crate::unit::{UnitBehavior, UnitContext};

mod aggregate;
mod event_loop;
mod message;
mod params;

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Warn
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let line = record.args().to_string();
            eprintln!("[{}] {line}", record.level());
            WARNINGS.lock().unwrap().push(line);
        }
    }

    fn flush(&self) {}
}

static WARNINGS: Lazy<Mutex<Vec<String>>> = Lazy::new(Mutex::default);

/// True once a warning or error containing `needle` was logged.
pub(crate) fn warned(needle: &str) -> bool {
    WARNINGS.lock().unwrap().iter().any(|line| line.contains(needle))
}

static LOGGER: Lazy<()> = Lazy::new(|| {
    static INSTANCE: StderrLogger = StderrLogger;
    if log::set_logger(&INSTANCE).is_ok() {
        log::set_max_level(log::LevelFilter::Warn);
    }
});

pub(crate) fn init_logger() {
    Lazy::force(&LOGGER);
}

pub(crate) const WAIT: Option<Duration> = Some(Duration::from_secs(2));

/// Records the names of executed messages.
///
/// `Reject*` messages are rejected, `Postpone*` messages are never replied,
/// everything else is accepted.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    pub(crate) seen: Arc<Mutex<Vec<String>>>,
    pub(crate) held: Arc<Mutex<Vec<Message>>>,
}

impl Recorder {
    pub(crate) fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl UnitBehavior for Recorder {
    fn execute_message(&mut self, _ctx: &UnitContext<'_>, msg: &Message) -> MsgResult {
        let name = msg.name();
        self.seen.lock().unwrap().push(name.clone());
        if name.starts_with("Reject") {
            MsgResult::Rejected
        } else if name.starts_with("Postpone") {
            self.held.lock().unwrap().push(msg.clone());
            MsgResult::Postponed
        } else {
            MsgResult::Accepted
        }
    }
}

/// Polls `cond` until it holds or two seconds pass.
pub(crate) fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(2) {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
