//! Instant-command and set-variable dispatch.
//!
//! Both paths resolve a request name against the item table, build the wire
//! command (descriptor plus converted argument payload), exchange it and
//! check the protocol's accepted marker. Writes are never retried: a timeout
//! leaves it unknown whether the device acted, and asking again could act
//! twice.

use crate::engine::PollEngine;
use crate::error::{Error, Result};
use crate::item::RwConstraint;
use crate::sink::StateSink;

impl<S: embedded_io::Read + embedded_io::Write> PollEngine<S> {
    /// Execute an instant command by its external name.
    ///
    /// `load.on` and `shutdown.return` are composite aliases: the first is a
    /// zero-delay `load.on.delay`, the second schedules a restart before
    /// dropping the load, so power coming back brings the load up again.
    pub fn instant_command(
        &mut self,
        sink: &mut dyn StateSink,
        name: &str,
        arg: Option<&str>,
    ) -> Result<(), S::Error> {
        match name {
            "load.on" if self.find_command("load.on").is_none() => {
                return self.instant_command(sink, "load.on.delay", Some("0"));
            }
            "shutdown.return" if self.find_command("shutdown.return").is_none() => {
                let restart_delay = sink
                    .value("ups.delay.start")
                    .unwrap_or_else(|| "0".to_string());
                self.instant_command(sink, "load.on.delay", Some(&restart_delay))?;
                return self.instant_command(sink, "load.off", None);
            }
            _ => {}
        }

        let idx = self
            .find_command(name)
            .ok_or_else(|| Error::Unknown(name.to_string()))?;
        let mut wire = self.items[idx].command.to_vec();
        if let Some(arg) = arg {
            let payload = self.items[idx]
                .convert
                .and_then(|c| c.to_device(arg))
                .ok_or(Error::Malformed("command argument not encodable"))?;
            wire.extend_from_slice(&payload);
        }

        tracing::info!(command = name, ?arg, "executing");
        self.execute_write(&wire)?;
        Ok(())
    }

    /// Write a new value to a settable variable.
    ///
    /// Validation goes against the *published* constraints, which may have
    /// been refined since Init, falling back to the table's declared ones.
    /// Enum matching is case-insensitive and the published casing wins.
    pub fn set_variable(
        &mut self,
        sink: &mut dyn StateSink,
        name: &str,
        value: &str,
    ) -> Result<(), S::Error> {
        let idx = self
            .items
            .iter()
            .position(|i| i.name == name && !i.flags.cmd() && !i.flags.skip())
            .ok_or_else(|| Error::Unknown(name.to_string()))?;
        if !self.items[idx].flags.settable() {
            return Err(Error::ReadOnly(name.to_string()));
        }

        let value = self.validate(sink, idx, value)?;
        let payload = self.items[idx]
            .convert
            .and_then(|c| c.to_device(&value))
            .ok_or(Error::Malformed("value not encodable"))?;
        let mut wire = self.items[idx].command.to_vec();
        wire.extend_from_slice(&payload);

        tracing::info!(variable = name, value, "writing");
        self.execute_write(&wire)?;
        sink.publish(name, &value);
        Ok(())
    }

    /// Initiate a shutdown, preferring a form the load can return from.
    /// Unlike ordinary writes, timeouts are retried here: at shutdown a
    /// command acting twice is harmless, a command not acting is not.
    pub fn shutdown(&mut self, sink: &mut dyn StateSink) -> Result<(), S::Error> {
        for name in ["shutdown.return", "shutdown.stayoff", "load.off"] {
            let mut tries = 0;
            loop {
                match self.instant_command(sink, name, None) {
                    Ok(()) => {
                        tracing::info!(command = name, "shutdown initiated");
                        return Ok(());
                    }
                    Err(Error::Unknown(_)) => break,
                    Err(Error::Timeout) if tries + 1 < crate::engine::MAX_TRIES => tries += 1,
                    Err(e) => return Err(e),
                }
            }
        }
        Err(Error::Unknown("shutdown".to_string()))
    }

    fn find_command(&self, name: &str) -> Option<usize> {
        self.items
            .iter()
            .position(|i| i.name == name && i.flags.cmd() && !i.flags.skip())
    }

    /// Check a candidate value against the active constraint and return the
    /// canonical form to send and publish.
    fn validate(
        &self,
        sink: &dyn StateSink,
        idx: usize,
        value: &str,
    ) -> Result<String, S::Error> {
        let item = &self.items[idx];
        let flags = item.flags;

        if flags.ranged() {
            let (min, max) = sink
                .range(item.name)
                .or(match item.rw {
                    Some(RwConstraint::Range { min, max }) => Some((min, max)),
                    _ => None,
                })
                .ok_or(Error::Malformed("range missing"))?;
            let number: f64 = value
                .trim()
                .parse()
                .map_err(|_| Error::Malformed("not a number"))?;
            if number < min || number > max {
                return Err(Error::OutOfRange {
                    value: number,
                    min,
                    max,
                });
            }
            return Ok(value.trim().to_string());
        }

        if flags.enumerated() {
            let published = sink.enum_values(item.name);
            let declared = match item.rw {
                Some(RwConstraint::Enum(values)) => {
                    Some(values.iter().map(|v| v.to_string()).collect::<Vec<_>>())
                }
                _ => None,
            };
            let allowed = published
                .or(declared)
                .ok_or(Error::Malformed("enum values missing"))?;
            return allowed
                .iter()
                .find(|candidate| candidate.eq_ignore_ascii_case(value.trim()))
                .cloned()
                .ok_or_else(|| Error::NotEnum(value.to_string()));
        }

        if flags.text() {
            let max = sink
                .text_width(item.name)
                .or(match item.rw {
                    Some(RwConstraint::Text { max_len }) => Some(max_len),
                    _ => None,
                })
                .ok_or(Error::Malformed("text width missing"))?;
            if value.len() > max {
                return Err(Error::TooLong { max });
            }
            return Ok(value.to_string());
        }

        Ok(value.to_string())
    }

    /// One un-retried write exchange, verified against the accepted marker.
    /// An empty answer counts as accepted for protocols that stay silent on
    /// success. Any success invalidates the cycle cache and schedules a
    /// semi-static re-read.
    fn execute_write(&mut self, wire: &[u8]) -> Result<(), S::Error> {
        let link = self.link.as_mut().ok_or(Error::NoTransport)?;
        let answer = match self.sub.round_trip(link, wire) {
            Ok(answer) => answer,
            Err(e) => return Err(self.comm_error(e)),
        };
        if !answer.is_empty() && !self.sub.accepted(&answer) {
            return Err(Error::Rejected);
        }
        self.last_answer = None;
        self.data_changed = true;
        Ok(())
    }
}
