//! Console Logger
//!
//! `log` backend that prints timestamped, colored lines to stderr

use chrono::Local;
use colored::Colorize;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

pub struct ConsoleLogger {
    level: LevelFilter,
    show_timestamps: bool,
}

impl ConsoleLogger {
    pub fn new(level: LevelFilter, show_timestamps: bool) -> Self {
        Self {
            level,
            show_timestamps,
        }
    }

    /// Installs the logger as the process-wide `log` backend.
    pub fn install(self) -> Result<(), SetLoggerError> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(())
    }

    pub fn format_line(&self, record: &Record<'_>) -> String {
        let level = match record.level() {
            Level::Error => "ERROR".bright_red().bold(),
            Level::Warn => "WARN ".yellow(),
            Level::Info => "INFO ".green(),
            Level::Debug => "DEBUG".blue(),
            Level::Trace => "TRACE".dimmed(),
        };
        let timestamp = if self.show_timestamps {
            format!("{} ", Local::now().format("%H:%M:%S%.3f"))
                .dimmed()
                .to_string()
        } else {
            String::new()
        };
        let thread = std::thread::current();
        let thread = thread.name().unwrap_or("?");
        format!("{timestamp}{level} [{thread}] {}", record.args())
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("{}", self.format_line(record));
        }
    }

    fn flush(&self) {}
}
