//! Record Formatter
//!
//! Formats kernel trace records for display

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Local;
use colored::Colorize;
use daqk::{TraceHook, TraceRecord};

/// Coarse grouping of trace records used for filtering and coloring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Loop,
    Unit,
    Dispatch,
    Message,
    Timeout,
}

impl RecordKind {
    pub fn of(record: &TraceRecord) -> Self {
        match record {
            TraceRecord::LoopStarted { .. } | TraceRecord::LoopStopped { .. } => Self::Loop,
            TraceRecord::UnitAttached { .. } | TraceRecord::UnitHalted { .. } => Self::Unit,
            TraceRecord::Dispatch { .. } => Self::Dispatch,
            TraceRecord::MessageSubmitted { .. } | TraceRecord::MessageReplied { .. } => {
                Self::Message
            }
            TraceRecord::Timeout { .. } => Self::Timeout,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "loop" | "lp" => Some(Self::Loop),
            "unit" => Some(Self::Unit),
            "dispatch" | "sched" => Some(Self::Dispatch),
            "msg" | "message" => Some(Self::Message),
            "tmout" | "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Loop => "LOOP",
            Self::Unit => "UNIT",
            Self::Dispatch => "DISPATCH",
            Self::Message => "MSG",
            Self::Timeout => "TMOUT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceFormatter {
    show_timestamps: bool,
    json_format: bool,
    filters: Option<HashSet<RecordKind>>,
}

impl TraceFormatter {
    pub fn new(show_timestamps: bool, json_format: bool) -> Self {
        Self {
            show_timestamps,
            json_format,
            filters: None,
        }
    }

    /// Restricts output to the named record kinds. Unknown names are
    /// ignored; an empty list removes the filter.
    pub fn set_filters(&mut self, names: &[String]) {
        if names.is_empty() {
            self.filters = None;
            return;
        }
        self.filters = Some(names.iter().filter_map(|n| RecordKind::parse(n)).collect());
    }

    /// Renders `record`, or `None` when it is filtered out.
    pub fn format_record(&self, record: &TraceRecord) -> Option<String> {
        let kind = RecordKind::of(record);
        if let Some(ref filters) = self.filters {
            if !filters.contains(&kind) {
                return None;
            }
        }
        Some(if self.json_format {
            self.format_json(record)
        } else {
            self.format_text(kind, record)
        })
    }

    /// Hook printing every accepted record to stdout.
    pub fn into_hook(self) -> TraceHook {
        Arc::new(move |record: &TraceRecord| {
            if let Some(line) = self.format_record(record) {
                println!("{line}");
            }
        })
    }

    fn format_text(&self, kind: RecordKind, record: &TraceRecord) -> String {
        let label = kind.label();
        let colored_label = match kind {
            RecordKind::Loop => label.bright_green(),
            RecordKind::Unit => label.bright_cyan(),
            RecordKind::Dispatch => label.bright_white(),
            RecordKind::Message => label.bright_blue(),
            RecordKind::Timeout => label.bright_yellow(),
        };
        let colored_label = match record {
            TraceRecord::MessageReplied { result, .. } if result != "Accepted" => {
                label.bright_red().bold()
            }
            _ => colored_label,
        };

        let timestamp_str = if self.show_timestamps {
            format!("[{}] ", Local::now().format("%H:%M:%S%.6f"))
                .dimmed()
                .to_string()
        } else {
            String::new()
        };

        format!("{}{:9} {}", timestamp_str, colored_label, record)
    }

    fn format_json(&self, record: &TraceRecord) -> String {
        let mut json = match serde_json::to_value(record) {
            Ok(value) => value,
            Err(err) => serde_json::json!({ "record": "unserializable", "error": err.to_string() }),
        };
        if self.show_timestamps {
            if let Some(obj) = json.as_object_mut() {
                obj.insert(
                    "timestamp".to_string(),
                    serde_json::Value::String(Local::now().to_rfc3339()),
                );
            }
        }
        json.to_string()
    }
}
