//! The framed-binary protocol family.
//!
//! Wire format: `SOH, length, index, command, data.., EOT`, where `length`
//! counts every byte after the length byte. Replies echo the index and
//! command bytes of the request; writes are acknowledged with a single ACK
//! data byte. A reply of index 0x00 / command NAK with no data is the
//! documented "command not supported" sentinel. The protocol also has a
//! capability query, so instant commands can be probed during Init without
//! executing them.

use modular_bitfield::prelude::*;

use crate::convert::{BeU16, ItemConverter, OnOff, U8Scale};
use crate::error::{Error, Result};
use crate::item::{Item, ValueFormat};
use crate::subdriver::Subdriver;
use crate::transport::Transport;

const SOH: u8 = 0x01;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x06;
/// Index byte of the "command not supported" sentinel reply.
const NAK_INDEX: u8 = 0x00;

/// Index + command + EOT, the fixed bytes counted by the length field.
const HEADER_TAIL: usize = 3;

/// Query descriptor for the capability probe; the probed command byte is
/// appended as the single data byte.
const CAPABILITY_QUERY: [u8; 2] = [0x01, 0x68];

/// The device status byte, bit 0 first.
#[bitfield]
#[derive(Clone, Copy, Debug)]
pub struct DeviceStatus {
    pub utility_fail: bool,
    pub battery_low: bool,
    pub boost_active: bool,
    pub trim_active: bool,
    pub output_off: bool,
    pub test_in_progress: bool,
    pub beeper_on: bool,
    pub fault: bool,
}

/// Status byte to status-word tokens.
struct StatusTokens;

impl ItemConverter for StatusTokens {
    fn from_device(&self, raw: &[u8]) -> Option<String> {
        let [byte] = raw else { return None };
        let status = DeviceStatus::from_bytes([*byte]);
        let mut tokens: Vec<&str> = Vec::new();
        tokens.push(if status.utility_fail() { "OB" } else { "OL" });
        if status.battery_low() {
            tokens.push("LB");
        }
        if status.boost_active() {
            tokens.push("BOOST");
        }
        if status.trim_active() {
            tokens.push("TRIM");
        }
        if status.output_off() {
            tokens.push("OFF");
        }
        if status.test_in_progress() {
            tokens.push("CAL");
        }
        if status.fault() {
            tokens.push("ALARM");
        }
        Some(tokens.join(" "))
    }
}

/// Beeper bit of the same status byte, published as its own variable.
struct BeeperBit;

impl ItemConverter for BeeperBit {
    fn from_device(&self, raw: &[u8]) -> Option<String> {
        let [byte] = raw else { return None };
        let status = DeviceStatus::from_bytes([*byte]);
        Some(if status.beeper_on() { "enabled" } else { "disabled" }.to_string())
    }
}

/// ASCII identity payload (model, firmware revision).
struct Ident;

impl ItemConverter for Ident {
    fn from_device(&self, raw: &[u8]) -> Option<String> {
        let text = core::str::from_utf8(raw).ok()?.trim();
        if text.is_empty() {
            return None;
        }
        Some(text.to_string())
    }
}

static DECI: BeU16 = BeU16 { factor: 0.1 };
static SECONDS: BeU16 = BeU16 { factor: 1.0 };
static PERCENT: U8Scale = U8Scale { factor: 1.0 };
static STATUS_TOKENS: StatusTokens = StatusTokens;
static BEEPER_BIT: BeeperBit = BeeperBit;
static IDENT: Ident = Ident;
static ON_OFF: OnOff = OnOff;

pub struct FramedUps;

impl FramedUps {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FramedUps {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the full frame for a command descriptor (`[index, command, data..]`).
fn encode(command: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(command.len() + 3);
    frame.push(SOH);
    frame.push((command.len() + 1) as u8);
    frame.extend_from_slice(command);
    frame.push(EOT);
    frame
}

/// Read and validate one reply frame, returning its data payload.
fn decode<S: embedded_io::Read + embedded_io::Write>(
    link: &mut Transport<S>,
    command: &[u8],
) -> Result<Vec<u8>, S::Error> {
    // The 2-byte prefix tells us how long the rest of the frame is.
    let prefix = link.receive_exact(2)?;
    if prefix[0] != SOH {
        return Err(Error::Malformed("bad start byte"));
    }
    let total = prefix[1] as usize;
    if total < HEADER_TAIL {
        return Err(Error::Malformed("frame too short"));
    }
    let rest = link.receive_exact(total)?;
    if rest[total - 1] != EOT {
        return Err(Error::Malformed("bad end byte"));
    }
    if rest[0] == NAK_INDEX && rest[1] == NAK && total == HEADER_TAIL {
        return Err(Error::Rejected);
    }
    // The echo must match before the payload is trusted at all.
    if rest[0] != command[0] {
        return Err(Error::Malformed("index mismatch"));
    }
    if rest[1] != command[1] {
        return Err(Error::Malformed("command echo mismatch"));
    }
    Ok(rest[2..total - 1].to_vec())
}

impl<S: embedded_io::Read + embedded_io::Write> Subdriver<S> for FramedUps {
    fn name(&self) -> &'static str {
        "framed"
    }

    fn claim(&mut self, link: &mut Transport<S>) -> bool {
        match self.round_trip(link, &[0x01, 0x20]) {
            Ok(payload) => Ident.from_device(&payload).is_some(),
            Err(_) => false,
        }
    }

    fn items(&self) -> Vec<Item> {
        vec![
            Item::new("ups.status", &[0x01, 0x30])
                .quick()
                .convert(&STATUS_TOKENS),
            Item::new("ups.beeper.status", &[0x01, 0x30]).convert(&BEEPER_BIT),
            Item::new("battery.voltage", &[0x01, 0x42])
                .convert(&DECI)
                .format(ValueFormat::OneDecimal),
            Item::new("battery.charge", &[0x01, 0x43])
                .convert(&PERCENT)
                .format(ValueFormat::Integer),
            Item::new("input.voltage", &[0x01, 0x44])
                .convert(&DECI)
                .format(ValueFormat::OneDecimal),
            Item::new("output.voltage", &[0x01, 0x45])
                .convert(&DECI)
                .format(ValueFormat::OneDecimal),
            Item::new("ups.load", &[0x01, 0x46])
                .convert(&PERCENT)
                .format(ValueFormat::Integer),
            Item::new("ups.temperature", &[0x01, 0x47])
                .convert(&DECI)
                .format(ValueFormat::OneDecimal),
            Item::new("input.frequency", &[0x01, 0x48])
                .convert(&DECI)
                .format(ValueFormat::OneDecimal),
            Item::new("ups.model", &[0x01, 0x20]).convert(&IDENT).fixed(),
            Item::new("ups.firmware", &[0x01, 0x21]).convert(&IDENT).fixed(),
            // Firmware-stored delays: they change only when written.
            Item::new("ups.delay.shutdown", &[0x02, 0x50])
                .range(0.0, 600.0)
                .semi_static()
                .convert(&SECONDS)
                .format(ValueFormat::Integer),
            Item::new("ups.delay.start", &[0x02, 0x51])
                .range(0.0, 43_200.0)
                .semi_static()
                .convert(&SECONDS)
                .format(ValueFormat::Integer),
            Item::new("ups.beeper.enable", &[0x02, 0x52])
                .enumerated(&["on", "off"])
                .semi_static()
                .convert(&ON_OFF),
            Item::new("load.off", &[0x03, 0x61]).cmd(),
            Item::new("load.on.delay", &[0x03, 0x62]).cmd().convert(&SECONDS),
            Item::new("shutdown.stayoff", &[0x03, 0x63]).cmd(),
            Item::new("test.battery.start.quick", &[0x03, 0x64]).cmd(),
            Item::new("beeper.toggle", &[0x03, 0x65]).cmd(),
        ]
    }

    fn round_trip(
        &mut self,
        link: &mut Transport<S>,
        command: &[u8],
    ) -> Result<Vec<u8>, S::Error> {
        if command.len() < 2 {
            return Err(Error::Malformed("command descriptor too short"));
        }
        link.send(&encode(command))?;
        decode(link, command)
    }

    fn accepted(&self, answer: &[u8]) -> bool {
        answer == [ACK]
    }

    fn probe_command(
        &mut self,
        link: &mut Transport<S>,
        command: &[u8],
    ) -> Result<bool, S::Error> {
        if command.len() < 2 {
            return Err(Error::Malformed("command descriptor too short"));
        }
        let mut probe = CAPABILITY_QUERY.to_vec();
        probe.push(command[1]);
        match self.round_trip(link, &probe) {
            Ok(payload) => match payload.as_slice() {
                [0] => Ok(false),
                [1] => Ok(true),
                _ => Err(Error::Malformed("bad capability reply")),
            },
            // Firmware without the capability query: trust the table.
            Err(Error::Rejected) => Ok(true),
            Err(e) => Err(e),
        }
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

    fn reply(index: u8, command: u8, data: &[u8]) -> Vec<u8> {
        let mut frame = vec![SOH, (data.len() + HEADER_TAIL) as u8, index, command];
        frame.extend_from_slice(data);
        frame.push(EOT);
        frame
    }

    #[test]
    fn encode_builds_the_documented_frame() {
        assert_eq!(
            encode(&[0x01, 0x40, 0xd0, 0xd1, 0xd2, 0xd3]),
            vec![SOH, 0x07, 0x01, 0x40, 0xd0, 0xd1, 0xd2, 0xd3, EOT]
        );
    }

    #[test]
    fn round_trip_returns_payload() {
        let mut l = link();
        let mut sub = FramedUps::new();
        // SOH, 0x07, index 0x01, command 0x40, four data bytes, EOT.
        l.link_mut()
            .queue_reply(&[SOH, 0x07, 0x01, 0x40, 0xd0, 0xd1, 0xd2, 0xd3, EOT]);
        let payload = sub
            .round_trip(&mut l, &[0x01, 0x40, 0xaa, 0xbb, 0xcc, 0xdd])
            .unwrap();
        assert_eq!(payload, vec![0xd0, 0xd1, 0xd2, 0xd3]);
    }

    #[test]
    fn altered_index_byte_is_malformed() {
        let mut l = link();
        let mut sub = FramedUps::new();
        l.link_mut()
            .queue_reply(&[SOH, 0x07, 0x02, 0x40, 0xd0, 0xd1, 0xd2, 0xd3, EOT]);
        match sub.round_trip(&mut l, &[0x01, 0x40]) {
            Err(Error::Malformed("index mismatch")) => {}
            other => panic!("expected index mismatch, got {other:?}"),
        }
    }

    #[test]
    fn command_echo_is_checked() {
        let mut l = link();
        let mut sub = FramedUps::new();
        l.link_mut().queue_reply(&reply(0x01, 0x41, &[0x00]));
        assert!(matches!(
            sub.round_trip(&mut l, &[0x01, 0x40]),
            Err(Error::Malformed("command echo mismatch"))
        ));
    }

    #[test]
    fn bad_envelope_bytes_are_malformed() {
        let mut l = link();
        let mut sub = FramedUps::new();
        l.link_mut().queue_reply(&[0x55, 0x03, 0x01, 0x40, EOT]);
        assert!(matches!(
            sub.round_trip(&mut l, &[0x01, 0x40]),
            Err(Error::Malformed("bad start byte"))
        ));

        let mut l = link();
        l.link_mut().queue_reply(&[SOH, 0x03, 0x01, 0x40, 0x00]);
        assert!(matches!(
            sub.round_trip(&mut l, &[0x01, 0x40]),
            Err(Error::Malformed("bad end byte"))
        ));
    }

    #[test]
    fn nak_sentinel_maps_to_rejected() {
        let mut l = link();
        let mut sub = FramedUps::new();
        l.link_mut().queue_reply(&reply(NAK_INDEX, NAK, &[]));
        assert!(matches!(
            sub.round_trip(&mut l, &[0x01, 0x43]),
            Err(Error::Rejected)
        ));
    }

    #[test]
    fn silence_is_a_timeout() {
        let mut l = link();
        let mut sub = FramedUps::new();
        assert!(matches!(
            sub.round_trip(&mut l, &[0x01, 0x40]),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn status_byte_decodes_to_tokens() {
        // utility fail + battery low + fault.
        let byte = 0b1000_0011;
        assert_eq!(StatusTokens.from_device(&[byte]).unwrap(), "OB LB ALARM");
        // All clear reads as online.
        assert_eq!(StatusTokens.from_device(&[0]).unwrap(), "OL");
    }

    #[test]
    fn beeper_bit_is_its_own_variable() {
        assert_eq!(BeeperBit.from_device(&[0b0100_0000]).unwrap(), "enabled");
        assert_eq!(BeeperBit.from_device(&[0]).unwrap(), "disabled");
    }

    #[test]
    fn capability_probe_interprets_replies() {
        let mut sub = FramedUps::new();

        let mut l = link();
        l.link_mut().queue_reply(&reply(0x01, 0x68, &[1]));
        assert!(sub.probe_command(&mut l, &[0x03, 0x61]).unwrap());

        let mut l = link();
        l.link_mut().queue_reply(&reply(0x01, 0x68, &[0]));
        assert!(!sub.probe_command(&mut l, &[0x03, 0x61]).unwrap());

        // No capability query in this firmware: table wins.
        let mut l = link();
        l.link_mut().queue_reply(&reply(NAK_INDEX, NAK, &[]));
        assert!(sub.probe_command(&mut l, &[0x03, 0x61]).unwrap());
    }

    #[test]
    fn capability_probe_needs_a_full_descriptor() {
        let mut l = link();
        let mut sub = FramedUps::new();
        assert!(matches!(
            sub.probe_command(&mut l, &[0x61]),
            Err(Error::Malformed("command descriptor too short"))
        ));
    }

    #[test]
    fn accepted_marker_is_a_single_ack() {
        let sub = FramedUps::new();
        assert!(Subdriver::<MockSerial>::accepted(&sub, &[ACK]));
        assert!(!Subdriver::<MockSerial>::accepted(&sub, &[]));
        assert!(!Subdriver::<MockSerial>::accepted(&sub, &[ACK, 0x00]));
    }
}
