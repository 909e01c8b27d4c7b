//! The published-state collaborator: wherever normalized values go.
//!
//! The real sink is a line-oriented IPC channel to a separate server process
//! and lives outside this crate; [MemorySink] is the map-backed stand-in used
//! by the demo binary and the unit tests. Validation of writes reads the
//! *published* constraints back from the sink, since ranges and enums can be
//! refined from device reports after Init.

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Access flags announced for one published variable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VarFlags {
    pub writable: bool,
    /// String-typed (validated by width); numeric otherwise.
    pub text: bool,
}

pub trait StateSink {
    fn publish(&mut self, name: &str, value: &str);
    fn publish_flags(&mut self, name: &str, flags: VarFlags);
    fn publish_range(&mut self, name: &str, min: f64, max: f64);
    fn publish_enum(&mut self, name: &str, values: &[&str]);
    fn publish_text_width(&mut self, name: &str, width: usize);
    fn add_command(&mut self, name: &str);
    fn remove_value(&mut self, name: &str);
    /// Downstream consumers must be able to tell "device said X" from "we
    /// have not heard from the device recently".
    fn mark_stale(&mut self);
    fn mark_ok(&mut self);

    fn value(&self, name: &str) -> Option<String>;
    fn range(&self, name: &str) -> Option<(f64, f64)>;
    fn enum_values(&self, name: &str) -> Option<Vec<String>>;
    fn text_width(&self, name: &str) -> Option<usize>;
}

/// In-memory sink for tests and the demo daemon.
#[derive(Default)]
pub struct MemorySink {
    values: BTreeMap<String, String>,
    flags: HashMap<String, VarFlags>,
    ranges: HashMap<String, (f64, f64)>,
    enums: HashMap<String, Vec<String>>,
    widths: HashMap<String, usize>,
    commands: BTreeSet<String>,
    stale: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().map(String::as_str)
    }

    pub fn variables(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn var_flags(&self, name: &str) -> Option<VarFlags> {
        self.flags.get(name).copied()
    }
}

impl StateSink for MemorySink {
    fn publish(&mut self, name: &str, value: &str) {
        tracing::debug!(name, value, "publish");
        self.values.insert(name.to_string(), value.to_string());
    }

    fn publish_flags(&mut self, name: &str, flags: VarFlags) {
        self.flags.insert(name.to_string(), flags);
    }

    fn publish_range(&mut self, name: &str, min: f64, max: f64) {
        self.ranges.insert(name.to_string(), (min, max));
    }

    fn publish_enum(&mut self, name: &str, values: &[&str]) {
        self.enums
            .insert(name.to_string(), values.iter().map(|v| v.to_string()).collect());
    }

    fn publish_text_width(&mut self, name: &str, width: usize) {
        self.widths.insert(name.to_string(), width);
    }

    fn add_command(&mut self, name: &str) {
        tracing::debug!(name, "command registered");
        self.commands.insert(name.to_string());
    }

    fn remove_value(&mut self, name: &str) {
        self.values.remove(name);
    }

    fn mark_stale(&mut self) {
        self.stale = true;
    }

    fn mark_ok(&mut self) {
        self.stale = false;
    }

    fn value(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }

    fn range(&self, name: &str) -> Option<(f64, f64)> {
        self.ranges.get(name).copied()
    }

    fn enum_values(&self, name: &str) -> Option<Vec<String>> {
        self.enums.get(name).cloned()
    }

    fn text_width(&self, name: &str) -> Option<usize> {
        self.widths.get(name).copied()
    }
}
