//! Battery charge/runtime guesstimation for devices that do not report them.
//!
//! Charge comes from a linear voltage mapping between a configured (or
//! autodetected) low/high range. When a runtime calibration is supplied, a
//! power-law discharge curve is fitted and integrated against wall-clock
//! time, with the voltage mapping acting as a one-way cross-check that can
//! only pull the estimate down (aging batteries fall short of the curve,
//! they never beat it).

use std::time::{Duration, Instant};

use crate::settings::Settings;

/// Plausible series/parallel pack multipliers, highest first. Ties favor
/// assuming more cells discharged rather than fewer, since voltage recovers
/// quickly once a load is removed.
const PACK_MULTIPLIERS: [f64; 18] = [
    120.0, 100.0, 80.0, 60.0, 48.0, 36.0, 30.0, 24.0, 18.0, 12.0, 8.0, 6.0, 5.0, 4.0, 3.0, 2.0,
    1.0, 0.5,
];

/// Tolerance band around the nominal per-pack voltage for autodetection.
const PACK_BAND_HIGH: f64 = 1.25;
const PACK_BAND_LOW: f64 = 0.8;

/// Default full-recharge time while online, when none is configured.
const DEFAULT_CHARGE_TIME: Duration = Duration::from_secs(43_200);

/// Power-law discharge fit from a two-point runtime calibration:
/// `runtime(load) = rt_full * (load_full / load) ^ exponent`.
#[derive(Clone, Copy, Debug)]
pub struct RuntimeCalibration {
    rt_full: f64,
    load_full: f64,
    exponent: f64,
}

impl RuntimeCalibration {
    /// Parse `runtime_high,load_high,runtime_low,load_low`, e.g.
    /// `660,100,3600,20`: 11 minutes at full load, an hour at 20%.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(',').map(|p| p.trim().parse::<f64>().ok());
        let rt_full = parts.next()??;
        let load_full = parts.next()??;
        let rt_part = parts.next()??;
        let load_part = parts.next()??;
        if parts.next().is_some() {
            return None;
        }
        if rt_full <= 0.0 || rt_part <= rt_full || load_part <= 0.0 || load_full <= load_part {
            return None;
        }
        let exponent = (rt_part / rt_full).ln() / (load_full / load_part).ln();
        Some(Self {
            rt_full,
            load_full,
            exponent,
        })
    }

    /// Predicted runtime in seconds at 100% charge for a given load percent.
    pub fn runtime(&self, load: f64) -> f64 {
        let load = load.max(0.1);
        self.rt_full * (self.load_full / load).powf(self.exponent)
    }
}

/// Per-cycle estimator output.
#[derive(Clone, Copy, Debug, Default)]
pub struct Estimate {
    pub charge: Option<f64>,
    pub runtime: Option<f64>,
}

/// The derived battery state. Mutated only by the estimator, read at the
/// publish step; persists across cycles.
pub struct BatteryModel {
    pub voltage_low: Option<f64>,
    pub voltage_high: Option<f64>,
    pub voltage_nominal: Option<f64>,
    /// Series/parallel multiplier dividing the measured voltage.
    pub packs: f64,
    packs_fixed: bool,
    packs_detected: bool,
    calibration: Option<RuntimeCalibration>,
    charge_time: Duration,
    charge_estimate: Option<f64>,
    last_tick: Option<Instant>,
}

impl BatteryModel {
    pub fn from_settings<C: Settings>(cfg: &C) -> Self {
        let packs = cfg.get_parsed::<f64>("battery.packs");
        let calibration = cfg
            .get_value("runtimecal")
            .and_then(RuntimeCalibration::parse);
        if cfg.get_value("runtimecal").is_some() && calibration.is_none() {
            tracing::warn!("runtimecal is unparseable, runtime estimation disabled");
        }
        Self {
            voltage_low: cfg.get_parsed("battery.voltage.low"),
            voltage_high: cfg.get_parsed("battery.voltage.high"),
            voltage_nominal: cfg.get_parsed("battery.voltage.nominal"),
            packs: packs.unwrap_or(1.0),
            packs_fixed: packs.is_some(),
            packs_detected: false,
            calibration,
            charge_time: cfg
                .get_parsed::<u64>("chargetime")
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CHARGE_TIME),
            charge_estimate: None,
            last_tick: None,
        }
    }

    pub fn has_voltage_range(&self) -> bool {
        self.voltage_low.is_some() && self.voltage_high.is_some()
    }

    pub fn has_calibration(&self) -> bool {
        self.calibration.is_some()
    }

    /// Linear voltage-to-charge mapping, clamped to 0..100.
    pub fn charge_from_voltage(&self, voltage: f64) -> Option<f64> {
        let low = self.voltage_low?;
        let high = self.voltage_high?;
        if high <= low {
            return None;
        }
        let v = voltage / self.packs;
        Some((100.0 * (v - low) / (high - low)).clamp(0.0, 100.0))
    }

    /// Pick the highest pack multiplier whose per-pack voltage lands inside
    /// the tolerance band around nominal. No-op when packs were configured
    /// explicitly, or after the first successful detection.
    pub fn detect_packs(&mut self, measured: f64) {
        if self.packs_fixed || self.packs_detected {
            return;
        }
        let Some(nominal) = self.voltage_nominal else {
            return;
        };
        for mult in PACK_MULTIPLIERS {
            let per_pack = measured / mult;
            if per_pack >= nominal * PACK_BAND_LOW && per_pack <= nominal * PACK_BAND_HIGH {
                if mult != self.packs {
                    tracing::info!(packs = mult, measured, nominal, "battery packs autodetected");
                }
                self.packs = mult;
                self.packs_detected = true;
                return;
            }
        }
        tracing::debug!(measured, nominal, "no pack multiplier fits, keeping current");
    }

    /// Advance the estimate by one tick.
    ///
    /// Online, the battery recharges toward 100% over `chargetime`; offline
    /// it discharges at the load-derived rate. A voltage-derived charge may
    /// only lower the estimate.
    pub fn update(
        &mut self,
        online: bool,
        voltage: Option<f64>,
        load: Option<f64>,
        now: Instant,
    ) -> Estimate {
        if let Some(v) = voltage {
            self.detect_packs(v);
        }
        let dt = self
            .last_tick
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        self.last_tick = Some(now);

        let volt_charge = voltage.and_then(|v| self.charge_from_voltage(v));

        let Some(cal) = self.calibration else {
            // Voltage-only device: the mapping is the whole estimate.
            self.charge_estimate = volt_charge;
            return Estimate {
                charge: volt_charge,
                runtime: None,
            };
        };

        let load = load.unwrap_or(100.0);
        let mut estimate = match self.charge_estimate {
            Some(e) => e,
            // First tick: trust the voltage if we have it, else assume full.
            None => volt_charge.unwrap_or(100.0),
        };
        if online {
            estimate += 100.0 * dt / self.charge_time.as_secs_f64();
        } else {
            estimate -= 100.0 * dt / cal.runtime(load);
        }
        estimate = estimate.clamp(0.0, 100.0);
        if let Some(vc) = volt_charge {
            if vc < estimate {
                estimate = vc;
            }
        }
        self.charge_estimate = Some(estimate);

        Estimate {
            charge: Some(estimate),
            runtime: Some(estimate / 100.0 * cal.runtime(load)),
        }
    }
}
