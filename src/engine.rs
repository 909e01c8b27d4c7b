//! The protocol-independent poll engine.
//!
//! Owns the claimed subdriver's item table and drives it through the walk
//! modes: a one-time Init walk that discovers what the device supports and
//! announces variables and commands, a QuickUpdate walk on every tick for the
//! handful of volatile items, and a FullUpdate walk at the configured poll
//! interval for everything else. Derived state (status word, battery
//! estimate) is reconciled at the end of each cycle before the sink is
//! marked fresh.

use std::time::{Duration, Instant};

use crate::battery::BatteryModel;
use crate::error::{Error, Result};
use crate::item::{Item, RwConstraint};
use crate::settings::Settings;
use crate::sink::{StateSink, VarFlags};
use crate::status::{StatusFlag, StatusWord};
use crate::subdriver::Subdriver;
use crate::transport::Transport;

/// Bounded retries on a silent device. Only [Error::Timeout] is retried;
/// a malformed or rejected answer will not get better by asking again.
pub(crate) const MAX_TRIES: usize = 3;

/// Seconds between FullUpdate walks when `pollfreq` is not configured.
const DEFAULT_POLL_FREQ: u64 = 30;

/// Log every link loss up to this count, then only every
/// [COMM_LOG_PERIOD]th, so a device left unplugged over a weekend does not
/// fill the journal.
const COMM_LOG_LIMIT: u64 = 10;
const COMM_LOG_PERIOD: u64 = 1000;

pub struct PollEngine<S: embedded_io::Read + embedded_io::Write> {
    pub(crate) link: Option<Transport<S>>,
    pub(crate) sub: Box<dyn Subdriver<S>>,
    pub(crate) items: Vec<Item>,
    pub(crate) status: StatusWord,
    battery: BatteryModel,
    poll_interval: Duration,
    last_full: Option<Instant>,
    /// Set by a successful write; forces semi-static items to be re-read on
    /// the next FullUpdate walk.
    pub(crate) data_changed: bool,
    ignore_lb: bool,
    charge_low: Option<f64>,
    runtime_low: Option<f64>,
    /// One-cycle answer cache, so items sharing a command coalesce into a
    /// single exchange.
    pub(crate) last_answer: Option<(&'static [u8], Vec<u8>)>,
    native_charge: bool,
    native_runtime: bool,
    comm_failures: u64,
}

impl<S: embedded_io::Read + embedded_io::Write> PollEngine<S> {
    pub fn new<C: Settings>(link: Transport<S>, sub: Box<dyn Subdriver<S>>, cfg: &C) -> Self {
        let items = sub.items();
        let charge_low = cfg.get_parsed("battery.charge.low");
        let runtime_low = cfg.get_parsed("battery.runtime.low");
        let mut ignore_lb = cfg.has_flag("ignorelb");
        if ignore_lb && charge_low.is_none() && runtime_low.is_none() {
            tracing::warn!("ignorelb set without battery.charge.low or battery.runtime.low, ignoring it");
            ignore_lb = false;
        }
        Self {
            link: Some(link),
            sub,
            items,
            status: StatusWord::new(),
            battery: BatteryModel::from_settings(cfg),
            poll_interval: Duration::from_secs(
                cfg.get_parsed("pollfreq").unwrap_or(DEFAULT_POLL_FREQ),
            ),
            last_full: None,
            data_changed: false,
            ignore_lb,
            charge_low,
            runtime_low,
            last_answer: None,
            native_charge: false,
            native_runtime: false,
            comm_failures: 0,
        }
    }

    /// Re-attach a freshly opened link after the previous one was lost.
    pub fn attach(&mut self, link: Transport<S>) {
        self.link = Some(link);
        self.comm_failures = 0;
    }

    pub fn has_link(&self) -> bool {
        self.link.is_some()
    }

    /// Drop the link, e.g. at orderly process exit.
    pub fn cleanup(&mut self) {
        if self.link.take().is_some() {
            tracing::info!("link closed");
        }
    }

    /// One-time discovery walk.
    ///
    /// Probes every row of the table: announces commands the device supports,
    /// publishes server-side-only defaults, reads everything else once, and
    /// marks unsupported rows `skip` so they are never asked again. A timeout
    /// on a quick-poll item aborts the walk, since losing those means losing
    /// the device.
    pub fn init_info(&mut self, sink: &mut dyn StateSink) -> Result<(), S::Error> {
        self.start_cycle();

        for idx in 0..self.items.len() {
            let name = self.items[idx].name;
            let flags = self.items[idx].flags;

            if flags.absent() {
                if let Some(default) = self.items[idx].default_value {
                    sink.publish(name, default);
                }
                continue;
            }

            if flags.cmd() {
                match self.probe_command(idx) {
                    Ok(true) => sink.add_command(name),
                    Ok(false) => {
                        tracing::debug!(command = name, "device does not support it");
                        self.items[idx].flags.set_skip(true);
                    }
                    Err(e) if e.is_rejection() => {
                        self.items[idx].flags.set_skip(true);
                    }
                    Err(Error::Timeout) => {
                        self.items[idx].flags.set_skip(true);
                    }
                    Err(e) => return Err(self.comm_error(e)),
                }
                continue;
            }

            match self.query(idx) {
                Ok(value) => {
                    self.announce(sink, idx);
                    self.apply(sink, idx, &value);
                }
                Err(e) if e.is_rejection() => {
                    tracing::debug!(item = name, error = %e, "unsupported, skipping from now on");
                    self.items[idx].flags.set_skip(true);
                }
                Err(Error::Timeout) | Err(Error::ShortRead { .. }) if flags.quick_poll() => {
                    sink.mark_stale();
                    return Err(Error::Timeout);
                }
                Err(Error::Timeout) | Err(Error::ShortRead { .. }) => {
                    tracing::debug!(item = name, "no answer, skipping from now on");
                    self.items[idx].flags.set_skip(true);
                }
                Err(e) => return Err(self.comm_error(e)),
            }
        }

        self.native_charge = self.device_reports("battery.charge");
        self.native_runtime = self.device_reports("battery.runtime");
        self.finish_cycle(sink);
        sink.mark_ok();
        Ok(())
    }

    /// One poll tick: QuickUpdate always, FullUpdate when the poll interval
    /// has elapsed.
    pub fn update_info(&mut self, sink: &mut dyn StateSink) -> Result<(), S::Error> {
        self.start_cycle();

        if let Err(e) = self.quick_walk(sink) {
            sink.mark_stale();
            return Err(self.comm_error(e));
        }

        // A write brings the full walk forward so its effect is visible on
        // the very next tick.
        let full_due = self.data_changed
            || self
                .last_full
                .map(|t| t.elapsed() >= self.poll_interval)
                .unwrap_or(true);
        let mut healthy = true;
        if full_due {
            match self.full_walk(sink) {
                Ok(any_success) => {
                    self.last_full = Some(Instant::now());
                    healthy = any_success;
                    if healthy {
                        self.data_changed = false;
                    }
                }
                Err(e) => {
                    sink.mark_stale();
                    return Err(self.comm_error(e));
                }
            }
        }

        self.finish_cycle(sink);
        if healthy {
            sink.mark_ok();
        } else {
            sink.mark_stale();
        }
        Ok(())
    }

    /// A cycle starts with no answers at all: the coalescing cache and every
    /// row's raw answer are from the previous snapshot and must not leak
    /// into this one.
    fn start_cycle(&mut self) {
        self.last_answer = None;
        for item in &mut self.items {
            item.raw_answer = None;
        }
        self.status.reset();
    }

    /// Volatile items only. All-or-nothing: any failure aborts the walk
    /// before a single value is pushed, so consumers never see a cycle that
    /// is half this tick and half the previous one.
    fn quick_walk(&mut self, sink: &mut dyn StateSink) -> Result<(), S::Error> {
        let mut staged: Vec<(usize, String)> = Vec::new();
        for idx in 0..self.items.len() {
            let flags = self.items[idx].flags;
            if !flags.quick_poll() || flags.skip() || flags.absent() {
                continue;
            }
            let value = self.query(idx)?;
            staged.push((idx, value));
        }
        for (idx, value) in staged {
            self.apply(sink, idx, &value);
        }
        Ok(())
    }

    /// Everything that is not quick, command, absent or identity data.
    /// Returns whether at least one item answered; a per-item failure only
    /// misses this cycle. Semi-static items are re-read only after a write.
    fn full_walk(&mut self, sink: &mut dyn StateSink) -> Result<bool, S::Error> {
        let mut attempted = 0usize;
        let mut answered = 0usize;
        for idx in 0..self.items.len() {
            let flags = self.items[idx].flags;
            if flags.quick_poll()
                || flags.cmd()
                || flags.absent()
                || flags.skip()
                || flags.fixed()
            {
                continue;
            }
            // Settable values only move when something writes them, whether
            // or not they are also marked semi-static.
            if (flags.semi_static() || flags.settable()) && !self.data_changed {
                continue;
            }
            attempted += 1;
            match self.query(idx) {
                Ok(value) => {
                    answered += 1;
                    self.apply(sink, idx, &value);
                }
                Err(e @ Error::DeviceGone(_)) | Err(e @ Error::NoTransport) => return Err(e),
                Err(e) => {
                    tracing::debug!(item = self.items[idx].name, error = %e, "missed this cycle");
                }
            }
        }
        Ok(attempted == 0 || answered > 0)
    }

    /// One coalesced read of an item: reuse this cycle's answer when another
    /// item already fetched the same command, otherwise exchange with bounded
    /// timeout retries, then window-extract, convert and format.
    fn query(&mut self, idx: usize) -> Result<String, S::Error> {
        let command = self.items[idx].command;
        let payload = match &self.last_answer {
            Some((cached, payload)) if *cached == command => payload.clone(),
            _ => {
                let link = self.link.as_mut().ok_or(Error::NoTransport)?;
                let mut tries = 0;
                let payload = loop {
                    match self.sub.round_trip(link, command) {
                        Ok(p) => break p,
                        Err(Error::Timeout) if tries + 1 < MAX_TRIES => {
                            tries += 1;
                            tracing::trace!(item = self.items[idx].name, tries, "retrying");
                        }
                        Err(e) => return Err(e),
                    }
                };
                self.last_answer = Some((command, payload.clone()));
                payload
            }
        };
        decode(&mut self.items[idx], &payload).ok_or(Error::Malformed("unconvertible answer"))
    }

    fn probe_command(&mut self, idx: usize) -> Result<bool, S::Error> {
        let command = self.items[idx].command;
        let link = self.link.as_mut().ok_or(Error::NoTransport)?;
        self.sub.probe_command(link, command)
    }

    /// Announce a variable's access metadata once, during Init.
    fn announce(&mut self, sink: &mut dyn StateSink, idx: usize) {
        let item = &self.items[idx];
        if !item.flags.settable() {
            return;
        }
        sink.publish_flags(
            item.name,
            VarFlags {
                writable: true,
                text: item.flags.text(),
            },
        );
        match item.rw {
            Some(RwConstraint::Range { min, max }) => sink.publish_range(item.name, min, max),
            Some(RwConstraint::Enum(values)) => sink.publish_enum(item.name, values),
            Some(RwConstraint::Text { max_len }) => sink.publish_text_width(item.name, max_len),
            None => {}
        }
    }

    /// Route one decoded value: status contributions feed the status word,
    /// alarm texts feed the alarm channel, everything else publishes as-is.
    fn apply(&mut self, sink: &mut dyn StateSink, idx: usize, value: &str) {
        match self.items[idx].name {
            "ups.status" => self.status.set(value),
            "ups.alarm" => self.status.alarm(value),
            name => sink.publish(name, value),
        }
    }

    /// End-of-cycle reconciliation: battery estimation for devices that do
    /// not report charge or runtime natively, low-battery override, then the
    /// status-word commit.
    fn finish_cycle(&mut self, sink: &mut dyn StateSink) {
        let voltage = self.item_value("battery.voltage");
        let load = self.item_value("ups.load");
        let online = !self.status.contains(StatusFlag::OnBattery);
        let estimate = self.battery.update(online, voltage, load, Instant::now());

        if !self.native_charge {
            if let Some(charge) = estimate.charge {
                sink.publish("battery.charge", &format!("{}", charge.round() as i64));
            }
        }
        if !self.native_runtime {
            if let Some(runtime) = estimate.runtime {
                sink.publish("battery.runtime", &format!("{}", runtime.round() as i64));
            }
        }

        if self.ignore_lb {
            // The device's own LB is distrusted; re-derive it from the
            // configured thresholds.
            self.status.clear_flag(StatusFlag::LowBattery);
            let charge = if self.native_charge {
                self.item_value("battery.charge")
            } else {
                estimate.charge
            };
            let runtime = if self.native_runtime {
                self.item_value("battery.runtime")
            } else {
                estimate.runtime
            };
            let low = matches!((charge, self.charge_low), (Some(c), Some(t)) if c <= t)
                || matches!((runtime, self.runtime_low), (Some(r), Some(t)) if r <= t);
            if low {
                self.status.set_flag(StatusFlag::LowBattery);
            }
        }

        self.status.commit(sink);
    }

    /// Last decoded numeric value of a named item, if any.
    fn item_value(&self, name: &str) -> Option<f64> {
        self.items
            .iter()
            .find(|i| i.name == name && !i.value.is_empty())
            .and_then(|i| i.value.parse().ok())
    }

    fn device_reports(&self, name: &str) -> bool {
        self.items.iter().any(|i| {
            i.name == name && !i.flags.skip() && !i.flags.absent() && !i.flags.cmd()
        })
    }

    /// Record a communication failure; a hard I/O error drops the link until
    /// [PollEngine::attach] supplies a new one.
    pub(crate) fn comm_error(&mut self, e: Error<S::Error>) -> Error<S::Error> {
        if matches!(e, Error::DeviceGone(_)) {
            self.comm_failures += 1;
            if self.comm_failures <= COMM_LOG_LIMIT || self.comm_failures % COMM_LOG_PERIOD == 0 {
                tracing::warn!(failures = self.comm_failures, error = %e, "link lost");
            }
            self.link = None;
        }
        e
    }
}

/// Window-extract, convert and format one answer payload, recording the raw
/// answer and the normalized value on the row.
fn decode(item: &mut Item, payload: &[u8]) -> Option<String> {
    let raw = match item.window {
        Some(window) => window.extract(payload)?,
        None => payload,
    };
    let text = match item.convert {
        Some(converter) => converter.from_device(raw)?,
        None => core::str::from_utf8(raw).ok()?.trim().to_string(),
    };
    let value = item.format.apply(&text);
    item.raw_answer = Some(payload.to_vec());
    item.value = value.clone();
    Some(value)
}
