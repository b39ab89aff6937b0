//! Unit parameters and configuration lookup.
//!
//! Parameters are [`Parameter`] child nodes of a unit. Configuration values
//! are resolved in this order: the message argument, the unit's own
//! parameter, the injected [`ParamHolder`], then the config master chain.

use std::collections::BTreeMap;

use crate::handle::Handle;
use crate::message::{Message, Value};
use crate::object::{NodeCore, Object};
use crate::sync::Mutex;
use crate::unit::UnitRunnable;

/// Bound on config master hops, guards against master cycles.
const MAX_MASTER_DEPTH: usize = 16;

/// External source of configuration values.
pub trait ParamHolder: Send + Sync {
    /// Value of `name` for the item at `path`, if configured.
    fn lookup(&self, path: &str, name: &str) -> Option<Value>;
}

/// In-memory [`ParamHolder`]. Keys are either `name` or `path/name`; the
/// path-qualified key wins.
#[derive(Default)]
pub struct MapParams {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MapParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.lock().insert(key.into(), value.into());
    }
}

impl ParamHolder for MapParams {
    fn lookup(&self, path: &str, name: &str) -> Option<Value> {
        let values = self.values.lock();
        values
            .get(&format!("{path}/{name}"))
            .or_else(|| values.get(name))
            .cloned()
    }
}

/// Named value attached to a unit.
pub struct Parameter {
    core: NodeCore,
    value: Mutex<Value>,
}

impl Parameter {
    pub fn value(&self) -> Value {
        self.value.lock().clone()
    }

    pub fn set_value(&self, value: impl Into<Value>) {
        *self.value.lock() = value.into();
    }
}

impl Object for Parameter {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn class_name(&self) -> &'static str {
        "Parameter"
    }
}

/// Creates parameter `name` under `unit`, or updates the existing one.
pub fn create_param(unit: &dyn UnitRunnable, name: &str, value: impl Into<Value>) -> Handle<Parameter> {
    let value = value.into();
    let existing = par(unit, name);
    if let Some(p) = existing.get() {
        p.set_value(value);
        return existing;
    }
    let param = Handle::new(Parameter {
        core: NodeCore::new(name),
        value: Mutex::new(value),
    });
    unit.core().add_child(param.clone().erase());
    param
}

/// Handle on parameter `name`, empty when there is none.
pub fn par(unit: &dyn UnitRunnable, name: &str) -> Handle<Parameter> {
    unit.core()
        .child_named(name)
        .downcast::<Parameter>()
        .unwrap_or_else(|_| Handle::null())
}

pub fn set_param(unit: &dyn UnitRunnable, name: &str, value: impl Into<Value>) -> bool {
    match par(unit, name).get() {
        Some(p) => {
            p.set_value(value);
            true
        }
        None => false,
    }
}

pub fn destroy_param(unit: &dyn UnitRunnable, name: &str) -> bool {
    let param = par(unit, name);
    match param.get() {
        Some(p) => unit.core().remove_child(p, true),
        None => false,
    }
}

/// Resolves configuration value `name` for `unit`.
pub fn cfg_value(unit: &dyn UnitRunnable, name: &str, msg: Option<&Message>) -> Option<Value> {
    if let Some(value) = msg.and_then(|m| m.get(name)) {
        return Some(value);
    }
    lookup_chain(unit, name, 0)
}

fn lookup_chain(unit: &dyn UnitRunnable, name: &str, depth: usize) -> Option<Value> {
    if let Some(p) = par(unit, name).get() {
        return Some(p.value());
    }
    if let Some(holder) = unit.shared().param_holder() {
        if let Some(value) = holder.lookup(&unit.core().path(), name) {
            return Some(value);
        }
    }
    if depth >= MAX_MASTER_DEPTH {
        log::warn!("{}: config master chain too deep for `{name}`", unit.core().name());
        return None;
    }
    let master = unit.shared().config_master()?;
    let value = master
        .get()
        .and_then(|m| lookup_chain(m.as_runnable(), name, depth + 1));
    value
}

pub fn cfg_str(unit: &dyn UnitRunnable, name: &str, msg: Option<&Message>, default: &str) -> String {
    cfg_value(unit, name, msg)
        .map(|v| v.as_str())
        .unwrap_or_else(|| default.to_string())
}

pub fn cfg_int(unit: &dyn UnitRunnable, name: &str, msg: Option<&Message>, default: i64) -> i64 {
    cfg_value(unit, name, msg)
        .and_then(|v| v.as_int())
        .unwrap_or(default)
}

pub fn cfg_double(unit: &dyn UnitRunnable, name: &str, msg: Option<&Message>, default: f64) -> f64 {
    cfg_value(unit, name, msg)
        .and_then(|v| v.as_double())
        .unwrap_or(default)
}

pub fn cfg_bool(unit: &dyn UnitRunnable, name: &str, msg: Option<&Message>, default: bool) -> bool {
    cfg_value(unit, name, msg)
        .and_then(|v| v.as_bool())
        .unwrap_or(default)
}
