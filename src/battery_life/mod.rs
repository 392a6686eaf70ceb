//! Battery protection ("BatteryLife") state machine.
//!
//! Tracks the charge phase of the battery and moves the dynamic SoC limit
//! up after deep discharges and down after the battery was full, so that a
//! battery that is rarely charged is not also cycled to the bottom every day.

use crate::battery_life::state::*;
use crate::port::EssCapabilities;
use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub mod state;

/// Seconds a battery may stay discharged before it is force charged.
pub const DEFAULT_FORCE_CHARGE_INTERVAL_SECS: i64 = 24 * 60 * 60;

fn bound(low: f64, v: f64, high: f64) -> f64 {
    low.max(v.min(high))
}

/// Persisted part of the protector.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BatteryLifeSettings {
    pub state: ProtectionState,
    pub flags: ProtectionFlags,
    /// Unix timestamp of the last discharge, 0 when unset
    pub discharged_time: i64,
    /// Limit in effect when the battery got discharged, -1 when unset
    pub discharged_soc: f64,
    pub soc_limit: f64,
    pub min_soc_limit: f64,
}

impl Default for BatteryLifeSettings {
    fn default() -> Self {
        Self {
            state: ProtectionState::Restart,
            flags: ProtectionFlags::empty(),
            discharged_time: 0,
            discharged_soc: -1.0,
            soc_limit: 10.0,
            min_soc_limit: 10.0,
        }
    }
}

impl BatteryLifeSettings {
    pub fn sanitize(&mut self) {
        self.flags = ProtectionFlags::from(self.flags.bits());
        self.discharged_time = self.discharged_time.max(0);
        self.discharged_soc = bound(-1.0, self.discharged_soc, 100.0);
        self.soc_limit = bound(0.0, self.soc_limit, 100.0);
        self.min_soc_limit = bound(0.0, self.min_soc_limit, 100.0);
    }

    /// The SoC floor the system may discharge to.
    pub fn active_soc_limit(&self) -> f64 {
        let m = self.min_soc_limit;
        if m > SOC_SWITCH_MAX {
            return m;
        }
        bound(0.0, m.max(self.soc_limit), SOC_SWITCH_MAX)
    }

    /// SoC above which a discharged battery is considered recovered.
    pub fn switch_on_soc(&self) -> f64 {
        let m = self.min_soc_limit;
        if m > SOC_SWITCH_MAX {
            return m + LOW_SOC_CHARGE_OFFSET;
        }
        self.active_soc_limit() + SOC_SWITCH_OFFSET
    }

    pub fn adjust_soc_limit(&mut self, delta: f64) {
        let limit = self.min_soc_limit.max(self.soc_limit) + delta;
        self.soc_limit = bound(0.0, limit, SOC_SWITCH_MAX);
    }

    pub fn discharged_at(&self) -> Option<DateTime<Utc>> {
        if self.discharged_time == 0 {
            return None;
        }
        DateTime::from_timestamp(self.discharged_time, 0)
    }
}

/// Values the protector tracks from the inverter.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatteryLifeInputs {
    pub soc: Option<f64>,
    /// An inverter/charger is connected
    pub vebus: bool,
    pub ess_assistant: bool,
    pub sustain: bool,
}

#[derive(Debug, Clone, Copy)]
struct Reading {
    soc: f64,
    sustain: bool,
}

pub struct BatteryLife {
    settings: BatteryLifeSettings,
    force_charge_interval: Duration,
    inputs: BatteryLifeInputs,
}

impl BatteryLife {
    pub fn new(settings: BatteryLifeSettings, force_charge_interval: Duration) -> Self {
        Self {
            settings,
            force_charge_interval,
            inputs: BatteryLifeInputs::default(),
        }
    }

    pub fn settings(&self) -> &BatteryLifeSettings {
        &self.settings
    }

    pub fn state(&self) -> ProtectionState {
        self.settings.state
    }

    pub fn replace_settings(&mut self, settings: BatteryLifeSettings) {
        self.settings = settings;
    }

    /// Evaluate the state machine against fresh inverter values.
    pub fn update(&mut self, inputs: BatteryLifeInputs, now: DateTime<Utc>) -> Transition {
        self.inputs = inputs;

        // Cannot start without an inverter or an SoC
        let soc = match (inputs.vebus, inputs.soc) {
            (true, Some(soc)) => soc,
            _ => {
                debug!("No vebus or no valid SoC");
                return Transition::Stay;
            }
        };

        if !inputs.ess_assistant {
            debug!("No ESS assistant found");
            return self.apply(Transition::To(ProtectionState::Disabled));
        }

        let next = self.transition(
            Reading {
                soc,
                sustain: inputs.sustain,
            },
            now,
        );
        self.apply(next)
    }

    fn apply(&mut self, t: Transition) -> Transition {
        match t {
            Transition::To(s) if s != self.settings.state => {
                info!("Battery protection state {} -> {}", self.settings.state, s);
                self.settings.state = s;
                t
            }
            _ => Transition::Stay,
        }
    }

    /// Periodic housekeeping, runs every 15 minutes.
    pub fn on_timer<Tz: TimeZone>(&mut self, now: DateTime<Tz>) {
        // First 15-minute window of the day starts a new cycle
        if now.hour() == 0 && now.minute() < 15 {
            if !self.settings.flags.is_empty() {
                debug!("Clearing daily protection flags");
            }
            self.settings.flags.clear();
        }

        if matches!(
            self.settings.state,
            ProtectionState::Discharged | ProtectionState::Sustain
        ) {
            if self.settings.discharged_time != 0 {
                let elapsed = now.timestamp() - self.settings.discharged_time;
                if elapsed > self.force_charge_interval.num_seconds() {
                    self.settings.adjust_soc_limit(SOC_SWITCH_INCREMENT);
                    self.apply(Transition::To(ProtectionState::ForceCharge));
                }
            } else {
                self.settings.discharged_time = now.timestamp();
            }
        }
    }

    fn transition(&mut self, r: Reading, now: DateTime<Utc>) -> Transition {
        use ProtectionState::*;
        match self.settings.state {
            // Only reached with the assistant present
            Disabled => Transition::To(Restart),
            Restart => self.default_phase(r, now, Adjust::Suppress),
            Default => self.default_phase(r, now, Adjust::Apply),
            Absorption => {
                if self.is_discharged(r) {
                    self.on_discharged(r, now, Adjust::Apply)
                } else if r.soc > FLOAT_LEVEL {
                    self.on_float(Adjust::Apply)
                } else if r.soc < FLOAT_LEVEL - SOC_SWITCH_OFFSET {
                    Transition::To(Default)
                } else {
                    Transition::Stay
                }
            }
            Float => {
                if self.is_discharged(r) {
                    self.on_discharged(r, now, Adjust::Apply)
                } else if r.soc < FLOAT_LEVEL - SOC_SWITCH_OFFSET {
                    Transition::To(Absorption)
                } else {
                    Transition::Stay
                }
            }
            Discharged | Sustain => {
                if !r.sustain && (r.soc > self.settings.switch_on_soc() || r.soc >= 100.0) {
                    Transition::To(Default)
                } else {
                    Transition::Stay
                }
            }
            ForceCharge => {
                if !r.sustain && (r.soc > self.settings.active_soc_limit() || r.soc >= 100.0) {
                    self.settings.discharged_time = now.timestamp();
                    Transition::To(Discharged)
                } else {
                    Transition::Stay
                }
            }
            LowSocCharge => Transition::To(Discharged),
            KeepCharged => Transition::Stay,
            SocGuardDefault => {
                if r.soc < 100.0 && r.soc <= self.settings.min_soc_limit {
                    Transition::To(SocGuardDischarged)
                } else {
                    Transition::Stay
                }
            }
            SocGuardDischarged => {
                if r.soc >= 100.0 || r.soc > self.settings.min_soc_limit + LOW_SOC_CHARGE_OFFSET {
                    Transition::To(SocGuardDefault)
                } else {
                    Transition::Stay
                }
            }
            SocGuardLowSocCharge => Transition::To(SocGuardDischarged),
        }
    }

    fn is_discharged(&self, r: Reading) -> bool {
        r.sustain || (r.soc <= self.settings.active_soc_limit() && r.soc < 100.0)
    }

    fn default_phase(&mut self, r: Reading, now: DateTime<Utc>, adjust: Adjust) -> Transition {
        if self.is_discharged(r) {
            self.on_discharged(r, now, adjust)
        } else if r.soc >= FLOAT_LEVEL {
            // While restarting this does not leave the current state, unlike absorption
            self.on_float(adjust)
        } else if r.soc >= ABSORPTION_LEVEL {
            self.on_absorption(adjust)
        } else {
            Transition::To(ProtectionState::Default)
        }
    }

    fn on_discharged(&mut self, r: Reading, now: DateTime<Utc>, adjust: Adjust) -> Transition {
        // Recharge back to the limit that was active when we got here, even
        // if the SoC drops further.
        let limit = self.settings.active_soc_limit();
        if self.settings.discharged_soc < 0.0 || self.settings.discharged_soc > limit {
            self.settings.discharged_soc = limit;
        }

        if adjust.applies() {
            if !self.settings.flags.contains(ProtectionFlags::DISCHARGED) {
                self.settings.flags.insert(ProtectionFlags::DISCHARGED);
                self.settings.adjust_soc_limit(SOC_SWITCH_INCREMENT);
            }
            self.settings.discharged_time = now.timestamp();
        }

        if r.sustain {
            Transition::To(ProtectionState::Sustain)
        } else {
            Transition::To(ProtectionState::Discharged)
        }
    }

    fn on_absorption(&mut self, adjust: Adjust) -> Transition {
        if adjust.applies() && !self.settings.flags.contains(ProtectionFlags::ABSORPTION) {
            self.settings.flags.insert(ProtectionFlags::ABSORPTION);
            self.settings.adjust_soc_limit(-SOC_SWITCH_INCREMENT);
        }
        Transition::To(ProtectionState::Absorption)
    }

    fn on_float(&mut self, adjust: Adjust) -> Transition {
        if !adjust.applies() {
            return Transition::Stay;
        }

        let mut offset = 0.0;
        for flag in [ProtectionFlags::ABSORPTION, ProtectionFlags::FLOAT] {
            if !self.settings.flags.contains(flag) {
                offset -= SOC_SWITCH_INCREMENT;
                self.settings.flags.insert(flag);
            }
        }
        self.settings.adjust_soc_limit(offset);
        Transition::To(ProtectionState::Float)
    }
}

impl EssCapabilities for BatteryLife {
    fn protection_state(&self) -> ProtectionState {
        self.settings.state
    }

    fn active_soc_limit(&self) -> Option<f64> {
        if self.inputs.vebus && self.inputs.soc.is_some() {
            Some(self.settings.active_soc_limit())
        } else {
            None
        }
    }

    fn has_ess_capability(&self) -> bool {
        self.inputs.ess_assistant
    }
}
