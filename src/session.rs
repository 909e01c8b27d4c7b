//! The session-token ASCII protocol family.
//!
//! Lines are `#`-prefixed and carriage-return terminated in both directions.
//! Before any data command is accepted, the client sends a fixed identifier
//! and the device must echo the fixed session hash; the handshake is redone
//! whenever the link is reopened. `NAK` means "command not understood". A
//! purely numeric two-or-three-digit reply straight after a write is the
//! write's status code (0 = accepted), not data.
//!
//! Most measurements share the single combined `D` line and are split out of
//! it by answer windows, so one exchange feeds many variables per cycle.

use crate::convert::{AsciiScale, ItemConverter, MinutesToSeconds};
use crate::error::{Error, Result};
use crate::item::{Item, ValueFormat};
use crate::subdriver::Subdriver;
use crate::transport::Transport;

const PREFIX: u8 = b'#';
const TERMINATOR: u8 = b'\r';
/// Fixed client identifier sent at session establishment.
const LOGIN_COMMAND: &[u8] = b"HELO UPSLINK10";
/// Fixed hash the device must echo back to accept the session.
const LOGIN_HASH: &[u8] = b"7A31C9D4";
const REJECTED_MARKER: &[u8] = b"NAK";
/// Answers longer than this are not a protocol the device speaks.
const MAX_ANSWER: usize = 256;

/// Combined `D` line layout:
/// `226.0 224.5 045 27.40 50.1 00110000`
///  input  output load battv freq flags
const MEASUREMENT_LINE: &[u8] = b"D";

/// Q1-style run of binary flag characters at the tail of the `D` line.
struct FlagChars;

impl ItemConverter for FlagChars {
    fn from_device(&self, raw: &[u8]) -> Option<String> {
        if raw.len() != 8 || !raw.iter().all(|c| matches!(c, b'0' | b'1')) {
            return None;
        }
        let bit = |i: usize| raw[i] == b'1';
        let mut tokens: Vec<&str> = Vec::new();
        tokens.push(if bit(0) { "OB" } else { "OL" });
        if bit(1) {
            tokens.push("LB");
        }
        if bit(2) {
            tokens.push("BYPASS");
        }
        if bit(3) {
            tokens.push("ALARM");
        }
        if bit(4) {
            tokens.push("OFF");
        }
        if bit(5) {
            tokens.push("CAL");
        }
        if bit(6) {
            tokens.push("FSD");
        }
        Some(tokens.join(" "))
    }
}

/// Beeper flag character of the same combined line.
struct BeeperChar;

impl ItemConverter for BeeperChar {
    fn from_device(&self, raw: &[u8]) -> Option<String> {
        match raw {
            [.., b'1'] if raw.len() == 8 => Some("enabled".to_string()),
            [.., b'0'] if raw.len() == 8 => Some("disabled".to_string()),
            _ => None,
        }
    }
}

/// Free-form text field, e.g. the device name.
struct Text;

impl ItemConverter for Text {
    fn from_device(&self, raw: &[u8]) -> Option<String> {
        Some(core::str::from_utf8(raw).ok()?.trim().to_string())
    }

    fn to_device(&self, value: &str) -> Option<Vec<u8>> {
        Some(value.as_bytes().to_vec())
    }
}

static PLAIN: AsciiScale = AsciiScale {
    factor: 1.0,
    encode_width: 3,
};
static MINUTES: MinutesToSeconds = MinutesToSeconds;
static FLAG_CHARS: FlagChars = FlagChars;
static BEEPER_CHAR: BeeperChar = BeeperChar;
static TEXT: Text = Text;

pub struct SessionUps {
    established: bool,
}

impl SessionUps {
    pub fn new() -> Self {
        Self { established: false }
    }

    /// One-time login handshake; every data command before it is refused by
    /// the device.
    fn establish<S: embedded_io::Read + embedded_io::Write>(
        &mut self,
        link: &mut Transport<S>,
    ) -> Result<(), S::Error> {
        let answer = exchange(link, LOGIN_COMMAND)?;
        if answer != LOGIN_HASH {
            return Err(Error::LoginFailed);
        }
        self.established = true;
        tracing::debug!("session established");
        Ok(())
    }
}

impl Default for SessionUps {
    fn default() -> Self {
        Self::new()
    }
}

/// Send one `#`-prefixed line and read back the payload of the reply line.
fn exchange<S: embedded_io::Read + embedded_io::Write>(
    link: &mut Transport<S>,
    command: &[u8],
) -> Result<Vec<u8>, S::Error> {
    let mut line = Vec::with_capacity(command.len() + 2);
    line.push(PREFIX);
    line.extend_from_slice(command);
    line.push(TERMINATOR);
    link.send(&line)?;

    let answer = link.receive_until(TERMINATOR, MAX_ANSWER)?;
    let payload = answer
        .strip_prefix(&[PREFIX])
        .ok_or(Error::Malformed("missing # prefix"))?;
    let payload = payload
        .strip_suffix(&[TERMINATOR])
        .ok_or(Error::Malformed("missing terminator"))?;
    if payload == REJECTED_MARKER {
        return Err(Error::Rejected);
    }
    Ok(payload.to_vec())
}

impl<S: embedded_io::Read + embedded_io::Write> Subdriver<S> for SessionUps {
    fn name(&self) -> &'static str {
        "session"
    }

    fn claim(&mut self, link: &mut Transport<S>) -> bool {
        if self.establish(link).is_err() {
            return false;
        }
        matches!(exchange(link, b"ID"), Ok(ref payload) if !payload.is_empty())
    }

    fn items(&self) -> Vec<Item> {
        vec![
            Item::new("ups.status", MEASUREMENT_LINE)
                .quick()
                .window(27, 8)
                .convert(&FLAG_CHARS),
            Item::new("ups.beeper.status", MEASUREMENT_LINE)
                .window(27, 8)
                .convert(&BEEPER_CHAR),
            Item::new("input.voltage", MEASUREMENT_LINE)
                .window(0, 5)
                .format(ValueFormat::OneDecimal),
            Item::new("output.voltage", MEASUREMENT_LINE)
                .window(6, 5)
                .format(ValueFormat::OneDecimal),
            Item::new("ups.load", MEASUREMENT_LINE)
                .window(12, 3)
                .format(ValueFormat::Integer),
            Item::new("battery.voltage", MEASUREMENT_LINE)
                .window(16, 5)
                .format(ValueFormat::OneDecimal),
            Item::new("input.frequency", MEASUREMENT_LINE)
                .window(22, 4)
                .format(ValueFormat::OneDecimal),
            Item::new("ups.model", b"ID").fixed().convert(&TEXT),
            Item::new("ups.id", b"NAM").text(8).semi_static().convert(&TEXT),
            // Stored in minutes on the device, published in seconds.
            Item::new("ups.delay.shutdown", b"PSD")
                .range(0.0, 600.0)
                .semi_static()
                .convert(&MINUTES)
                .format(ValueFormat::Integer),
            Item::new("ups.delay.start", b"PON")
                .range(0.0, 43_200.0)
                .semi_static()
                .convert(&MINUTES)
                .format(ValueFormat::Integer),
            Item::new("load.off", b"SOFF").cmd(),
            Item::new("load.on.delay", b"SON").cmd().convert(&PLAIN),
            Item::new("test.battery.start.quick", b"TST").cmd(),
            Item::new("beeper.toggle", b"BZT").cmd(),
        ]
    }

    fn round_trip(
        &mut self,
        link: &mut Transport<S>,
        command: &[u8],
    ) -> Result<Vec<u8>, S::Error> {
        if !self.established {
            self.establish(link)?;
        }
        exchange(link, command)
    }

    fn accepted(&self, answer: &[u8]) -> bool {
        // Write status code: 2-3 digits, zero means accepted.
        if !(2..=3).contains(&answer.len()) || !answer.iter().all(u8::is_ascii_digit) {
            return false;
        }
        answer.iter().all(|d| *d == b'0')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_serial::MockSerial;
    use std::time::Duration;

    fn link() -> Transport<MockSerial> {
        Transport::new(MockSerial::new(), Duration::from_millis(10))
    }

    #[test]
    fn login_handshake_must_match_the_hash() {
        let mut l = link();
        l.link_mut().queue_reply(b"#7A31C9D4\r");
        let mut sub = SessionUps::new();
        sub.establish(&mut l).unwrap();
        assert!(sub.established);
        assert_eq!(l.link_mut().written_data(), b"#HELO UPSLINK10\r");
    }

    #[test]
    fn wrong_hash_refuses_the_session() {
        let mut l = link();
        l.link_mut().queue_reply(b"#DEADBEEF\r");
        let mut sub = SessionUps::new();
        assert!(matches!(sub.establish(&mut l), Err(Error::LoginFailed)));
        assert!(!sub.established);
    }

    #[test]
    fn round_trip_establishes_session_first() {
        let mut l = link();
        l.link_mut().queue_reply(b"#7A31C9D4\r");
        l.link_mut().queue_reply(b"#226.0 224.5 045 27.40 50.1 00110000\r");
        let mut sub = SessionUps::new();
        let payload = sub.round_trip(&mut l, b"D").unwrap();
        assert_eq!(payload, b"226.0 224.5 045 27.40 50.1 00110000");
        assert_eq!(
            l.link_mut().written_data(),
            b"#HELO UPSLINK10\r#D\r"
        );
    }

    #[test]
    fn reply_must_start_with_prefix() {
        let mut l = link();
        l.link_mut().queue_reply(b"226.0\r");
        assert!(matches!(
            exchange(&mut l, b"D"),
            Err(Error::Malformed("missing # prefix"))
        ));
    }

    #[test]
    fn nak_maps_to_rejected() {
        let mut l = link();
        l.link_mut().queue_reply(b"#NAK\r");
        assert!(matches!(exchange(&mut l, b"XYZ"), Err(Error::Rejected)));
    }

    #[test]
    fn flag_chars_decode_to_tokens() {
        assert_eq!(FlagChars.from_device(b"00110000").unwrap(), "OL BYPASS ALARM");
        assert_eq!(FlagChars.from_device(b"11000000").unwrap(), "OB LB");
        assert!(FlagChars.from_device(b"0011000").is_none());
        assert!(FlagChars.from_device(b"0011000x").is_none());
    }

    #[test]
    fn windows_split_the_combined_line() {
        let sub = SessionUps::new();
        let payload = b"226.0 224.5 045 27.40 50.1 00110000";
        let items = Subdriver::<MockSerial>::items(&sub);
        let battery = items
            .iter()
            .find(|i| i.name == "battery.voltage")
            .unwrap();
        let slice = battery.window.unwrap().extract(payload).unwrap();
        assert_eq!(slice, b"27.40");
    }

    #[test]
    fn write_status_codes() {
        let sub = SessionUps::new();
        assert!(Subdriver::<MockSerial>::accepted(&sub, b"00"));
        assert!(Subdriver::<MockSerial>::accepted(&sub, b"000"));
        assert!(!Subdriver::<MockSerial>::accepted(&sub, b"01"));
        assert!(!Subdriver::<MockSerial>::accepted(&sub, b"0"));
        assert!(!Subdriver::<MockSerial>::accepted(&sub, b"ok"));
    }
}
