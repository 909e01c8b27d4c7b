//! This crate provides a polling driver core for the Q*-family of serial UPS
//! hardware: one protocol-independent engine plus pluggable subdrivers, one
//! per wire-protocol dialect.
//!
//! A subdriver contributes two things: the byte-level framing for its dialect
//! and a declarative item table mapping external variable names
//! (`battery.charge`, `ups.delay.shutdown`, ...) to device commands and
//! conversion rules. The engine does everything else: claiming the device at
//! startup, the Init/QuickUpdate/FullUpdate walk modes, status-word and alarm
//! aggregation, battery charge/runtime estimation for devices that do not
//! report them, and validated instant-command / set-variable dispatch.
//!
//! Two dialects ship in-tree:
//! * [framed::FramedUps]: binary SOH/EOT envelopes with a command echo and a
//!   capability query.
//! * [session::SessionUps]: `#`-prefixed CR-terminated ASCII lines behind a
//!   login handshake.
//!
//! Anything implementing [embedded_io::Read] + [embedded_io::Write] can carry
//! the bytes; [serial] provides the usual exclusive-open serial port on Unix.
//!
//! The serial side of the supported hardware expects:
//! * Default baud rate: 2400
//! * Data bits: 8
//! * Stop bits: 1
//! * Parity: None

pub mod battery;
pub mod convert;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod framed;
pub mod item;
#[cfg(unix)]
pub mod serial;
pub mod session;
pub mod settings;
pub mod sink;
pub mod status;
pub mod subdriver;
pub mod transport;

#[cfg(test)]
mod mock_serial;

use subdriver::Subdriver;

/// All in-tree subdrivers, in claim-probe order.
pub fn registry<S: embedded_io::Read + embedded_io::Write>() -> Vec<Box<dyn Subdriver<S>>> {
    vec![
        Box::new(framed::FramedUps::new()),
        Box::new(session::SessionUps::new()),
    ]
}
