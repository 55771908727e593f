//! Duty-cycle enforcement.
//!
//! Keeps a sliding-window ledger of transmissions per regulated sub-band and
//! gates every outbound frame on the regional airtime budget.

pub mod airtime;
pub mod regions;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use loramesh_wire::types::MessageKind;
use tracing::warn;

use self::regions::{Band, RegionPreset};
use crate::error::TransportError;

/// Duty-cycle manager configuration. Applied atomically via `set_config`.
#[derive(Debug, Clone)]
pub struct DutyCycleConfig {
    pub region: &'static RegionPreset,
    pub tracking_window: Duration,
    /// Overrides every sub-band limit when set (percent, 0 < x <= 100).
    pub max_duty_cycle_override: Option<f64>,
    /// Hard cap on a single frame's airtime.
    pub max_transmission_time: Duration,
    /// Fraction of the budget at which warnings fire.
    pub warn_threshold: f64,
    pub emergency_override_enabled: bool,
    pub strict_compliance: bool,
    pub spreading_factor: u8,
    pub bandwidth_hz: u32,
}

impl Default for DutyCycleConfig {
    fn default() -> Self {
        Self {
            region: regions::region("EU").expect("EU preset embedded"),
            tracking_window: Duration::from_secs(3600),
            max_duty_cycle_override: None,
            max_transmission_time: Duration::from_secs(4),
            warn_threshold: 0.8,
            emergency_override_enabled: false,
            strict_compliance: false,
            spreading_factor: 7,
            bandwidth_hz: 125_000,
        }
    }
}

impl DutyCycleConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.tracking_window.is_zero() {
            return Err(TransportError::ConfigInvalid(
                "tracking window must be non-zero".into(),
            ));
        }
        if !(7..=12).contains(&self.spreading_factor) {
            return Err(TransportError::ConfigInvalid(format!(
                "spreading factor {} outside 7..=12",
                self.spreading_factor
            )));
        }
        if let Some(pct) = self.max_duty_cycle_override
            && !(pct > 0.0 && pct <= 100.0)
        {
            return Err(TransportError::ConfigInvalid(format!(
                "duty cycle override {pct} outside (0, 100]"
            )));
        }
        if !(self.warn_threshold > 0.0 && self.warn_threshold <= 1.0) {
            return Err(TransportError::ConfigInvalid(
                "warn threshold outside (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Append-only transmission record kept for the regulatory audit window.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmissionRecord {
    pub started_at: Instant,
    pub started_unix_ms: u64,
    pub duration: Duration,
    pub frequency_mhz: f64,
    pub power_dbm: f64,
    pub kind: MessageKind,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Budget exhausted; admissible once the oldest contributing records
    /// slide out of the window.
    Deferred { until: Instant },
    /// Emergency override: transmit anyway. `violation` is set under strict
    /// compliance and must be surfaced to the caller.
    Bypass { violation: bool },
    /// Can never be admitted (frame exceeds the per-frame cap or the whole
    /// window budget).
    Rejected,
}

#[derive(Debug, Clone, Default)]
pub struct DutyCycleStats {
    pub transmissions: u64,
    pub airtime_ms: u64,
    pub warnings: u64,
    pub violations: u64,
    pub deferred: u64,
    pub rejected: u64,
}

/// Per-band usage snapshot for observability.
#[derive(Debug, Clone, PartialEq)]
pub struct BandUsage {
    pub min_mhz: f64,
    pub max_mhz: f64,
    pub limit_percent: f64,
    pub used_percent: f64,
}

pub struct DutyCycleManager {
    config: DutyCycleConfig,
    ledger: VecDeque<TransmissionRecord>,
    stats: DutyCycleStats,
}

impl DutyCycleManager {
    pub fn new(config: DutyCycleConfig) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self {
            config,
            ledger: VecDeque::new(),
            stats: DutyCycleStats::default(),
        })
    }

    pub fn config(&self) -> &DutyCycleConfig {
        &self.config
    }

    /// Replaces the configuration atomically after validation.
    pub fn set_config(&mut self, config: DutyCycleConfig) -> Result<(), TransportError> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Estimated airtime of a frame of `payload_len` bytes under the
    /// configured modulation.
    pub fn estimate_airtime(&self, payload_len: usize) -> Duration {
        airtime::time_on_air(payload_len, self.config.spreading_factor, self.config.bandwidth_hz)
    }

    fn limit_fraction(&self, band: &Band) -> f64 {
        self.config
            .max_duty_cycle_override
            .unwrap_or(band.duty_cycle_percent)
            / 100.0
    }

    fn used_in_band(&self, band: &Band, now: Instant) -> Duration {
        let horizon = now.checked_sub(self.config.tracking_window);
        self.ledger
            .iter()
            .filter(|rec| band.contains(rec.frequency_mhz))
            .filter(|rec| horizon.is_none_or(|h| rec.started_at >= h))
            .map(|rec| rec.duration)
            .sum()
    }

    /// Current utilization of the band containing `frequency_mhz`, as a
    /// fraction of the window.
    pub fn current_duty_cycle(&self, frequency_mhz: f64, now: Instant) -> f64 {
        match self.config.region.band_of(frequency_mhz) {
            Some(band) => {
                self.used_in_band(band, now).as_secs_f64() / self.config.tracking_window.as_secs_f64()
            }
            None => 0.0,
        }
    }

    /// Checks whether a transmission of `duration` at `frequency_mhz` fits
    /// the band budget right now.
    pub fn evaluate(
        &mut self,
        duration: Duration,
        frequency_mhz: f64,
        emergency: bool,
        now: Instant,
    ) -> Admission {
        self.trim(now);

        if duration > self.config.max_transmission_time {
            self.stats.rejected += 1;
            return Admission::Rejected;
        }

        let Some(band) = self.config.region.band_of(frequency_mhz) else {
            warn!(frequency_mhz, "transmission outside any regulated band");
            return Admission::Granted;
        };

        let window = self.config.tracking_window;
        let budget = window.mul_f64(self.limit_fraction(band));
        if duration > budget {
            self.stats.rejected += 1;
            return Admission::Rejected;
        }

        let used = self.used_in_band(band, now);
        if used + duration <= budget {
            return Admission::Granted;
        }

        if emergency && self.config.emergency_override_enabled {
            let violation = self.config.strict_compliance;
            if violation {
                self.stats.violations += 1;
            }
            return Admission::Bypass { violation };
        }

        self.stats.deferred += 1;
        let until = self.earliest_admissible_at(band, duration, budget, used, now);
        Admission::Deferred { until }
    }

    /// The instant at which enough of the oldest records will have slid out
    /// of the window for `duration` to fit.
    fn earliest_admissible_at(
        &self,
        band: &Band,
        duration: Duration,
        budget: Duration,
        used: Duration,
        now: Instant,
    ) -> Instant {
        let need_to_drop = (used + duration).saturating_sub(budget);
        let mut dropped = Duration::ZERO;
        for rec in self.ledger.iter().filter(|r| band.contains(r.frequency_mhz)) {
            dropped += rec.duration;
            if dropped >= need_to_drop {
                return rec.started_at + self.config.tracking_window;
            }
        }
        now + self.config.tracking_window
    }

    /// Appends a record after the radio actually transmitted.
    pub fn record_transmission(
        &mut self,
        duration: Duration,
        frequency_mhz: f64,
        power_dbm: f64,
        kind: MessageKind,
        now: Instant,
        unix_ms: u64,
    ) {
        self.ledger.push_back(TransmissionRecord {
            started_at: now,
            started_unix_ms: unix_ms,
            duration,
            frequency_mhz,
            power_dbm,
            kind,
        });
        self.stats.transmissions += 1;
        self.stats.airtime_ms += duration.as_millis() as u64;

        if let Some(band) = self.config.region.band_of(frequency_mhz) {
            let used = self.used_in_band(band, now).as_secs_f64();
            let budget = self.config.tracking_window.as_secs_f64() * self.limit_fraction(band);
            if budget > 0.0 && used / budget >= self.config.warn_threshold {
                self.stats.warnings += 1;
                warn!(
                    frequency_mhz,
                    used_pct = (used / budget * 100.0) as u32,
                    "duty-cycle budget nearly exhausted"
                );
            }
        }
        self.trim(now);
    }

    fn trim(&mut self, now: Instant) {
        let Some(horizon) = now.checked_sub(self.config.tracking_window) else {
            return;
        };
        while let Some(front) = self.ledger.front() {
            if front.started_at < horizon {
                self.ledger.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &TransmissionRecord> {
        self.ledger.iter()
    }

    pub fn stats(&self) -> &DutyCycleStats {
        &self.stats
    }

    /// Usage snapshot across every band of the configured region.
    pub fn band_usage(&self, now: Instant) -> Vec<BandUsage> {
        self.config
            .region
            .bands
            .iter()
            .map(|band| BandUsage {
                min_mhz: band.min_mhz,
                max_mhz: band.max_mhz,
                limit_percent: self.limit_fraction(band) * 100.0,
                used_percent: self.used_in_band(band, now).as_secs_f64()
                    / self.config.tracking_window.as_secs_f64()
                    * 100.0,
            })
            .collect()
    }
}
