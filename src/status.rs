//! Status-word and alarm aggregation.
//!
//! Items namespaced as status contributions fan their tokens in here over one
//! poll cycle; `commit` renders the deduplicated set in declared precedence
//! order (ALARM always first) and pushes it to the sink together with the
//! alarm-text channel.

use core::str::FromStr;

use strum_macros::{Display, EnumIter, EnumString};

use crate::sink::StateSink;

/// Injected on the alarm-text channel when the ALARM flag was raised but no
/// item supplied a human-readable message that cycle, so consumers are never
/// left with a contradictory "ALARM set, alarm text empty" state.
const ALARM_PLACEHOLDER: &str = "Device reports an alarm condition";

/// Boolean device conditions. ALARM outranks everything else in rendering;
/// the remaining tokens keep the order in which they were first set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumIter, EnumString)]
pub enum StatusFlag {
    #[strum(serialize = "ALARM")]
    Alarm,
    #[strum(serialize = "OL")]
    Online,
    #[strum(serialize = "OB")]
    OnBattery,
    #[strum(serialize = "LB")]
    LowBattery,
    #[strum(serialize = "RB")]
    ReplaceBattery,
    #[strum(serialize = "CHRG")]
    Charging,
    #[strum(serialize = "DISCHRG")]
    Discharging,
    #[strum(serialize = "BYPASS")]
    Bypass,
    #[strum(serialize = "CAL")]
    Calibrating,
    #[strum(serialize = "BOOST")]
    Boost,
    #[strum(serialize = "TRIM")]
    Trim,
    #[strum(serialize = "OVER")]
    Overloaded,
    #[strum(serialize = "OFF")]
    OutputOff,
    #[strum(serialize = "FSD")]
    ForcedShutdown,
}

impl StatusFlag {
    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// The bit-set of device conditions being built during one poll cycle.
#[derive(Default)]
pub struct StatusWord {
    bits: u16,
    /// First-set order, for rendering. ALARM is hoisted to the front at
    /// render time no matter when it arrived.
    order: Vec<StatusFlag>,
    alarms: Vec<String>,
}

impl StatusWord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh cycle.
    pub fn reset(&mut self) {
        self.bits = 0;
        self.order.clear();
        self.alarms.clear();
    }

    /// Accept one or more whitespace-separated tokens. A leading `!` clears
    /// the bit instead of setting it. Setting an already-set bit is a no-op,
    /// so repeated contributions within one cycle render once.
    pub fn set(&mut self, tokens: &str) {
        for token in tokens.split_whitespace() {
            let (clear, name) = match token.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, token),
            };
            match StatusFlag::from_str(name) {
                Ok(flag) if clear => self.clear_flag(flag),
                Ok(flag) => self.set_flag(flag),
                Err(_) => tracing::debug!(token, "ignoring unknown status token"),
            }
        }
    }

    pub fn set_flag(&mut self, flag: StatusFlag) {
        if self.bits & flag.bit() == 0 {
            self.bits |= flag.bit();
            self.order.push(flag);
        }
    }

    pub fn clear_flag(&mut self, flag: StatusFlag) {
        self.bits &= !flag.bit();
        self.order.retain(|f| *f != flag);
    }

    pub fn contains(&self, flag: StatusFlag) -> bool {
        self.bits & flag.bit() != 0
    }

    /// Queue one alarm message. Deliberately not deduplicated: two
    /// independent faults may carry identical wording.
    pub fn alarm(&mut self, text: &str) {
        self.alarms.push(text.to_string());
    }

    /// Render the set tokens, ALARM first, the rest in first-set order.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.contains(StatusFlag::Alarm) {
            out.push_str("ALARM");
        }
        for flag in &self.order {
            if *flag == StatusFlag::Alarm {
                continue;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&flag.to_string());
        }
        out
    }

    /// Publish `ups.status` and the alarm-text channel for this cycle.
    pub fn commit(&mut self, sink: &mut dyn StateSink) {
        if self.contains(StatusFlag::Alarm) && self.alarms.is_empty() {
            self.alarms.push(ALARM_PLACEHOLDER.to_string());
        }
        if self.alarms.is_empty() {
            sink.remove_value("ups.alarm");
        } else {
            sink.publish("ups.alarm", &self.alarms.join(" "));
        }
        sink.publish("ups.status", &self.render());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use strum::IntoEnumIterator;

    #[test]
    fn tokens_round_trip_through_display() {
        // Every token must parse back to the same flag it rendered from.
        for flag in StatusFlag::iter() {
            let parsed = StatusFlag::from_str(&flag.to_string()).unwrap();
            assert_eq!(parsed, flag);
        }
    }

    #[test]
    fn duplicate_tokens_render_once() {
        let mut word = StatusWord::new();
        word.set("OB");
        word.set("OB");
        word.set("LB");
        assert_eq!(word.render(), "OB LB");
    }

    #[test]
    fn alarm_always_renders_first() {
        let mut word = StatusWord::new();
        word.set("OL BOOST");
        word.set("ALARM");
        word.set("OB");
        assert_eq!(word.render(), "ALARM OL BOOST OB");
    }

    #[test]
    fn bang_prefix_clears_a_bit() {
        let mut word = StatusWord::new();
        word.set("OL LB");
        word.set("!LB");
        assert_eq!(word.render(), "OL");
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        let mut word = StatusWord::new();
        word.set("OL WOBBLE");
        assert_eq!(word.render(), "OL");
    }

    #[test]
    fn placeholder_injected_when_alarm_has_no_text() {
        let mut word = StatusWord::new();
        let mut sink = MemorySink::new();
        word.set("ALARM OB");
        word.commit(&mut sink);
        assert_eq!(sink.value("ups.status").unwrap(), "ALARM OB");
        assert_eq!(sink.value("ups.alarm").unwrap(), ALARM_PLACEHOLDER);
    }

    #[test]
    fn real_alarm_text_suppresses_placeholder() {
        let mut word = StatusWord::new();
        let mut sink = MemorySink::new();
        word.set("ALARM");
        word.alarm("fan failure");
        word.alarm("fan failure");
        word.commit(&mut sink);
        // Alarm text is not deduplicated and keeps call order.
        assert_eq!(sink.value("ups.alarm").unwrap(), "fan failure fan failure");
    }

    #[test]
    fn no_alarm_clears_the_text_channel() {
        let mut word = StatusWord::new();
        let mut sink = MemorySink::new();
        sink.publish("ups.alarm", "stale text");
        word.set("OL");
        word.commit(&mut sink);
        assert!(sink.value("ups.alarm").is_none());
        assert_eq!(sink.value("ups.status").unwrap(), "OL");
    }

    #[test]
    fn reset_clears_bits_and_texts() {
        let mut word = StatusWord::new();
        word.set("ALARM OB");
        word.alarm("something");
        word.reset();
        assert_eq!(word.render(), "");
        let mut sink = MemorySink::new();
        word.commit(&mut sink);
        assert!(sink.value("ups.alarm").is_none());
    }
}
