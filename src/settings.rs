//! The configuration collaborator.
//!
//! The real config parser (driver config sections plus CLI overrides) lives
//! outside this crate; the engine only ever sees `get_value`/`has_flag`.
//! [DriverSettings] is the simple `name=value` / bare-flag implementation
//! used by the demo binary and the tests.

use std::collections::{HashMap, HashSet};

pub trait Settings {
    fn get_value(&self, name: &str) -> Option<&str>;
    fn has_flag(&self, name: &str) -> bool;

    /// Parse a value, treating unparseable text the same as absent.
    fn get_parsed<T: core::str::FromStr>(&self, name: &str) -> Option<T> {
        self.get_value(name).and_then(|v| v.parse().ok())
    }
}

#[derive(Default)]
pub struct DriverSettings {
    values: HashMap<String, String>,
    flags: HashSet<String>,
}

impl DriverSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `name=value` pairs and bare flags, e.g. the argument tail
    /// of the demo binary.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Self {
        let mut settings = Self::new();
        for arg in args {
            match arg.split_once('=') {
                Some((name, value)) => settings.set(name, value),
                None => settings.set_flag(&arg),
            }
        }
        settings
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.values.insert(name.to_string(), value.to_string());
    }

    pub fn set_flag(&mut self, name: &str) {
        self.flags.insert(name.to_string());
    }
}

impl Settings for DriverSettings {
    fn get_value(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    fn has_flag(&self, name: &str) -> bool {
        self.flags.contains(name) || self.values.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pairs_and_flags() {
        let s = DriverSettings::from_args(
            ["pollfreq=30", "ignorelb", "runtimecal=660,100,3600,20"]
                .map(String::from),
        );
        assert_eq!(s.get_value("pollfreq"), Some("30"));
        assert!(s.has_flag("ignorelb"));
        assert!(s.has_flag("pollfreq"));
        assert!(!s.has_flag("missing"));
        assert_eq!(s.get_parsed::<u64>("pollfreq"), Some(30));
        assert_eq!(s.get_parsed::<u64>("runtimecal"), None);
    }
}
