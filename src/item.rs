//! The mapping table model: one [Item] binds an externally visible variable
//! to a device command plus a conversion rule.
//!
//! Subdrivers declare their tables with the builder methods here; the poll
//! engine drives the rows through the walk modes. Only `raw_answer`, `value`
//! and the `skip` flag mutate at runtime.

use modular_bitfield::prelude::*;

use crate::convert::ItemConverter;

/// Capability flags for one item-table row.
///
/// `absent` marks server-side-only values that are published from their
/// default and never queried. `skip` is set once at runtime when a probe
/// proves the item unsupported, and is never re-tried after Init.
#[bitfield]
#[derive(Clone, Copy, Debug)]
pub struct ItemFlags {
    pub cmd: bool,
    pub settable: bool,
    pub enumerated: bool,
    pub ranged: bool,
    pub quick_poll: bool,
    pub semi_static: bool,
    pub absent: bool,
    pub text: bool,
    pub skip: bool,
    /// Never changes after Init (model name, firmware revision); queried once.
    pub fixed: bool,
    #[skip]
    __: B6,
}

/// Expected location of an item's value inside the decoded answer payload.
#[derive(Clone, Copy, Debug)]
pub struct AnswerWindow {
    pub start: usize,
    pub len: usize,
    /// When set, the payload's first byte must match or the answer is
    /// treated as malformed.
    pub leading: Option<u8>,
}

impl AnswerWindow {
    /// Extract the configured substring, validating the leading byte.
    pub fn extract<'a>(&self, payload: &'a [u8]) -> Option<&'a [u8]> {
        if let Some(lead) = self.leading {
            if payload.first() != Some(&lead) {
                return None;
            }
        }
        payload.get(self.start..self.start + self.len)
    }
}

/// Per-item numeric formatting template, so the same raw value can be
/// published as a percentage, volts with one decimal, or plain text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ValueFormat {
    #[default]
    Text,
    Integer,
    OneDecimal,
}

impl ValueFormat {
    pub fn apply(&self, value: &str) -> String {
        let value = value.trim();
        match self {
            ValueFormat::Text => value.to_string(),
            ValueFormat::Integer => match value.parse::<f64>() {
                Ok(v) => format!("{}", v.round() as i64),
                Err(_) => value.to_string(),
            },
            ValueFormat::OneDecimal => match value.parse::<f64>() {
                Ok(v) => format!("{v:.1}"),
                Err(_) => value.to_string(),
            },
        }
    }
}

/// Declared read-write constraint for a settable item. The engine publishes
/// these at Init; validation at write time goes against the *published*
/// values, which may since have been refined from device reports.
#[derive(Clone, Copy, Debug)]
pub enum RwConstraint {
    Range { min: f64, max: f64 },
    Enum(&'static [&'static str]),
    Text { max_len: usize },
}

/// One externally visible variable, bound to one device command and a
/// conversion rule.
pub struct Item {
    /// Dotted external identifier, e.g. `battery.charge`.
    pub name: &'static str,
    /// Opaque protocol-specific request descriptor; the subdriver frames it.
    pub command: &'static [u8],
    pub flags: ItemFlags,
    pub window: Option<AnswerWindow>,
    pub convert: Option<&'static dyn ItemConverter>,
    pub format: ValueFormat,
    pub rw: Option<RwConstraint>,
    pub default_value: Option<&'static str>,
    /// Last decoded reply, cleared every cycle.
    pub raw_answer: Option<Vec<u8>>,
    /// Last parsed value after window extraction and conversion.
    pub value: String,
}

impl Item {
    pub fn new(name: &'static str, command: &'static [u8]) -> Self {
        Self {
            name,
            command,
            flags: ItemFlags::new(),
            window: None,
            convert: None,
            format: ValueFormat::Text,
            rw: None,
            default_value: None,
            raw_answer: None,
            value: String::new(),
        }
    }

    /// Re-queried on every quick-update tick; a failure here is treated as
    /// communications lost.
    pub fn quick(mut self) -> Self {
        self.flags.set_quick_poll(true);
        self
    }

    /// An instant command, not a data variable.
    pub fn cmd(mut self) -> Self {
        self.flags.set_cmd(true);
        self
    }

    /// Changes only in response to a write; re-queried only after one.
    pub fn semi_static(mut self) -> Self {
        self.flags.set_semi_static(true);
        self
    }

    /// Static identity data, queried once during Init and never again.
    pub fn fixed(mut self) -> Self {
        self.flags.set_fixed(true);
        self
    }

    /// Server-side-only: published from the default, never queried.
    pub fn absent(mut self, default: &'static str) -> Self {
        self.flags.set_absent(true);
        self.default_value = Some(default);
        self
    }

    pub fn window(mut self, start: usize, len: usize) -> Self {
        self.window = Some(AnswerWindow {
            start,
            len,
            leading: None,
        });
        self
    }

    pub fn window_lead(mut self, start: usize, len: usize, leading: u8) -> Self {
        self.window = Some(AnswerWindow {
            start,
            len,
            leading: Some(leading),
        });
        self
    }

    pub fn convert(mut self, converter: &'static dyn ItemConverter) -> Self {
        self.convert = Some(converter);
        self
    }

    pub fn format(mut self, format: ValueFormat) -> Self {
        self.format = format;
        self
    }

    /// Settable, numeric, range-constrained.
    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.flags.set_settable(true);
        self.flags.set_ranged(true);
        self.rw = Some(RwConstraint::Range { min, max });
        self
    }

    /// Settable, constrained to an enumerated value set.
    pub fn enumerated(mut self, values: &'static [&'static str]) -> Self {
        self.flags.set_settable(true);
        self.flags.set_enumerated(true);
        self.rw = Some(RwConstraint::Enum(values));
        self
    }

    /// Settable free-form text with a maximum width.
    pub fn text(mut self, max_len: usize) -> Self {
        self.flags.set_settable(true);
        self.flags.set_text(true);
        self.rw = Some(RwConstraint::Text { max_len });
        self
    }
}
