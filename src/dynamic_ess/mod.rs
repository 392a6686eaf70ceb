//! Dynamic ESS: turns a list of time windows with target SoCs into
//! charge/discharge overrides for the inverter.

use crate::battery_life::state::ProtectionState;
use crate::dynamic_ess::rate::ChargeRate;
use crate::dynamic_ess::window::{ScheduleSetting, ScheduleWindow};
use crate::port::{EssCapabilities, FeedInExcess, Override, Telemetry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use tracing::{debug, info};

pub mod rate;
pub mod window;

pub const NUM_SCHEDULES: usize = 4;
/// Largest feed-in the inverter accepts as a setpoint, in watts
pub const SELL_POWER: f64 = -32000.0;
/// Hub4Mode value for "ESS under external control"
pub const HUB4_EXTERNAL_CONTROL: u16 = 3;

const UNRESTRICTED: f64 = -1.0;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DynamicEssSettings {
    /// 0 off, 1 auto, 2 buy, 3 sell, 4 local
    pub mode: u8,
    /// kWh
    pub capacity: f64,
    /// Percent
    pub efficiency: f64,
    /// Bit 0 disallows battery export, bit 1 disallows battery import
    pub restrictions: u8,
    pub schedule: [ScheduleSetting; NUM_SCHEDULES],
}

impl Default for DynamicEssSettings {
    fn default() -> Self {
        Self {
            mode: 0,
            capacity: 0.0,
            efficiency: 90.0,
            restrictions: 0,
            schedule: Default::default(),
        }
    }
}

impl DynamicEssSettings {
    pub fn sanitize(&mut self) {
        self.mode = self.mode.min(4);
        self.capacity = self.capacity.clamp(0.0, 1000.0);
        self.efficiency = self.efficiency.clamp(0.0, 100.0);
        self.restrictions = self.restrictions.min(2);
        self.schedule.iter_mut().for_each(|s| s.sanitize());
    }

    pub fn battery_export(&self) -> bool {
        self.restrictions & 1 == 0
    }

    pub fn battery_import(&self) -> bool {
        self.restrictions & 2 == 0
    }

    pub fn windows(&self) -> impl Iterator<Item = ScheduleWindow> + '_ {
        self.schedule.iter().filter_map(|s| s.window())
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum DessMode {
    Off = 0,
    Auto = 1,
    Buy = 2,
    Sell = 3,
    Local = 4,
}

impl From<u8> for DessMode {
    fn from(v: u8) -> Self {
        match v {
            1 => DessMode::Auto,
            2 => DessMode::Buy,
            3 => DessMode::Sell,
            4 => DessMode::Local,
            _ => DessMode::Off,
        }
    }
}

impl Display for DessMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DessMode::Off => "Off",
            DessMode::Auto => "Auto",
            DessMode::Buy => "Buy",
            DessMode::Sell => "Sell",
            DessMode::Local => "Local",
        };
        write!(f, "{}", s)
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    None = 0,
    NoEss = 1,
    EssMode = 2,
    NoMatchingSchedule = 3,
    SocLow = 4,
    CapacityUnset = 5,
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::None => "No error",
            ErrorCode::NoEss => "No ESS",
            ErrorCode::EssMode => "ESS mode",
            ErrorCode::NoMatchingSchedule => "No matching schedule",
            ErrorCode::SocLow => "SOC low",
            ErrorCode::CapacityUnset => "Battery capacity unset",
        };
        write!(f, "{}", s)
    }
}

/// Published diagnostics.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Status {
    pub active: DessMode,
    pub error: ErrorCode,
    pub target_soc: Option<f64>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            active: DessMode::Off,
            error: ErrorCode::None,
            target_soc: None,
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Active: {}, Error: {} ({})", self.active, self.error, self.error as u8)?;
        match self.target_soc {
            Some(soc) => write!(f, ", Target: {}%", soc),
            None => write!(f, ", Target: none"),
        }
    }
}

/// Largest allowed feed-in as a (negative) grid setpoint.
pub fn max_feed_in_power(limit: Option<f64>) -> f64 {
    match limit {
        Some(l) if l >= 0.0 => (-l).max(SELL_POWER),
        _ => SELL_POWER,
    }
}

pub struct DynamicEss {
    status: Status,
    charge_hysteresis: u8,
    discharge_hysteresis: u8,
    rate: ChargeRate,
    running: bool,
}

impl DynamicEss {
    pub fn new(mode: u8) -> Self {
        Self {
            status: Status::default(),
            charge_hysteresis: 0,
            discharge_hysteresis: 0,
            rate: ChargeRate::default(),
            running: mode > 0,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Restart the control loop when the mode leaves Off. Returns true when
    /// the loop was started.
    pub fn mode_changed(&mut self, old: u8, new: u8) -> bool {
        if old == 0 && new > 0 && !self.running {
            debug!("Dynamic ESS enabled, starting control loop");
            self.running = true;
            return true;
        }
        false
    }

    /// One control iteration. Returns the overrides to write.
    pub fn tick<C: EssCapabilities>(
        &mut self,
        now: DateTime<Utc>,
        telemetry: &Telemetry,
        settings: &DynamicEssSettings,
        caps: &C,
    ) -> Vec<Override> {
        let before = self.status;
        let mut out = Vec::new();
        self.control(now, telemetry, settings, caps, &mut out);
        if self.status != before {
            info!("Dynamic ESS {}", self.status);
        }
        out
    }

    fn control<C: EssCapabilities>(
        &mut self,
        now: DateTime<Utc>,
        t: &Telemetry,
        settings: &DynamicEssSettings,
        caps: &C,
        out: &mut Vec<Override>,
    ) {
        let mode = match DessMode::from(settings.mode) {
            DessMode::Off => {
                self.deactivate(ErrorCode::None, out);
                self.running = false;
                return;
            }
            m => m,
        };

        let (soc, min_soc) = match (t.soc, caps.active_soc_limit()) {
            (Some(soc), Some(min_soc)) => (soc, min_soc),
            _ => return self.deactivate(ErrorCode::SocLow, out),
        };

        if !caps.has_ess_capability() {
            return self.deactivate(ErrorCode::NoEss, out);
        }

        if settings.capacity == 0.0 {
            return self.deactivate(ErrorCode::CapacityUnset, out);
        }

        // Keep-charged or external control leaves nothing to schedule
        if caps.protection_state() == ProtectionState::KeepCharged
            || t.hub4_mode == Some(HUB4_EXTERNAL_CONTROL)
        {
            return self.deactivate(ErrorCode::EssMode, out);
        }

        match mode {
            DessMode::Buy => {
                self.status = Status {
                    active: DessMode::Buy,
                    error: ErrorCode::None,
                    target_soc: None,
                };
                out.extend([
                    Override::FeedInExcess(FeedInExcess::Normal),
                    Override::ForceCharge(true),
                    Override::Setpoint(None),
                    Override::MaxChargePower(UNRESTRICTED),
                    Override::MaxDischargePower(UNRESTRICTED),
                ]);
            }
            DessMode::Sell => {
                self.status.active = DessMode::Sell;
                self.status.error = ErrorCode::None;
                out.extend([
                    Override::FeedInExcess(FeedInExcess::Allowed),
                    Override::ForceCharge(false),
                    Override::Setpoint(Some(max_feed_in_power(t.max_feed_in_power))),
                    Override::MaxDischargePower(UNRESTRICTED),
                ]);
            }
            _ => self.scheduled(now, soc, min_soc, t, settings, out),
        }
    }

    fn scheduled(
        &mut self,
        now: DateTime<Utc>,
        soc: f64,
        min_soc: f64,
        t: &Telemetry,
        settings: &DynamicEssSettings,
        out: &mut Vec<Override>,
    ) {
        let Some(w) = settings.windows().find(|w| w.is_inside(now)) else {
            if self.status.active != DessMode::Off {
                self.deactivate(ErrorCode::NoMatchingSchedule, out);
            }
            return;
        };

        self.status.active = DessMode::Auto;
        self.status.error = ErrorCode::None;
        if self.status.target_soc != Some(w.soc) {
            self.rate.reset();
        }
        self.status.target_soc = Some(w.soc);

        out.push(Override::FeedInExcess(if w.allow_feedin {
            FeedInExcess::Allowed
        } else {
            FeedInExcess::Normal
        }));

        let pv = t.pv_power();
        if soc + f64::from(self.charge_hysteresis) < w.soc {
            self.charge_hysteresis = 0;
            self.discharge_hysteresis = 0;
            out.extend([
                Override::Setpoint(None),
                Override::ForceCharge(true),
                Override::MaxDischargePower(UNRESTRICTED),
            ]);

            // The inverter only needs to buy what PV does not provide
            self.rate
                .update(soc, w.remaining(now), (soc - w.soc).abs(), settings.capacity);
            if settings.battery_import() {
                if let Some(rate) = self.rate.get() {
                    out.push(Override::MaxChargePower((rate - pv).max(0.0)));
                }
            } else {
                out.push(Override::MaxChargePower(t.ac_pv()));
            }
            return;
        }

        self.charge_hysteresis = 1;
        out.extend([
            Override::MaxChargePower(UNRESTRICTED),
            Override::ForceCharge(false),
        ]);

        if soc - f64::from(self.discharge_hysteresis) > w.soc.max(min_soc) {
            self.discharge_hysteresis = 0;
            self.rate
                .update(soc, w.remaining(now), (soc - w.soc).abs(), settings.capacity);
            // Without battery export only cover local consumption, plus a
            // watt to allow selling overvoltage.
            let limit = if settings.battery_export() {
                match self.rate.get() {
                    Some(rate) if rate != 0.0 => rate + pv,
                    _ => UNRESTRICTED,
                }
            } else {
                pv + t.consumption() + 1.0
            };
            out.push(Override::MaxDischargePower(limit));
        } else {
            // Idle: take no more from the DC bus than DC-coupled PV provides.
            // The SoC has to move a full percent to leave this state.
            self.discharge_hysteresis = 1;
            out.push(Override::MaxDischargePower((0.9 * pv).round().max(1.0)));
        }

        out.push(Override::Setpoint(if w.allow_feedin {
            Some(max_feed_in_power(t.max_feed_in_power))
        } else {
            None
        }));
    }

    fn deactivate(&mut self, reason: ErrorCode, out: &mut Vec<Override>) {
        out.extend([
            Override::Setpoint(None),
            Override::ForceCharge(false),
            Override::MaxChargePower(UNRESTRICTED),
            Override::MaxDischargePower(UNRESTRICTED),
            Override::FeedInExcess(FeedInExcess::Off),
        ]);
        self.status = Status {
            active: DessMode::Off,
            error: reason,
            target_soc: None,
        };
        self.rate.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    struct Caps {
        state: ProtectionState,
        limit: Option<f64>,
        ess: bool,
    }

    impl Default for Caps {
        fn default() -> Self {
            Self {
                state: ProtectionState::Default,
                limit: Some(20.0),
                ess: true,
            }
        }
    }

    impl EssCapabilities for Caps {
        fn protection_state(&self) -> ProtectionState {
            self.state
        }

        fn active_soc_limit(&self) -> Option<f64> {
            self.limit
        }

        fn has_ess_capability(&self) -> bool {
            self.ess
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn telemetry(soc: f64) -> Telemetry {
        Telemetry {
            soc: Some(soc),
            vebus: true,
            ess_assistant: true,
            dc_pv_power: Some(100.0),
            ac_consumption: [Some(300.0), Some(200.0), None],
            ac_pv_on_grid: [Some(50.0), None, Some(25.0)],
            hub4_mode: Some(1),
            max_feed_in_power: Some(5000.0),
            ..Default::default()
        }
    }

    fn settings(mode: DessMode, target: f64, allow_feedin: bool) -> DynamicEssSettings {
        let mut s = DynamicEssSettings {
            mode: mode as u8,
            capacity: 10.0,
            ..Default::default()
        };
        s.schedule[0] = ScheduleSetting {
            start: (now() - Duration::hours(1)).timestamp(),
            duration: 2 * 3600,
            soc: target,
            allow_feedin,
        };
        s
    }

    fn neutral() -> Vec<Override> {
        vec![
            Override::Setpoint(None),
            Override::ForceCharge(false),
            Override::MaxChargePower(-1.0),
            Override::MaxDischargePower(-1.0),
            Override::FeedInExcess(FeedInExcess::Off),
        ]
    }

    #[test]
    fn off_deactivates_and_stops() {
        let mut d = DynamicEss::new(1);
        assert!(d.is_running());
        let out = d.tick(
            now(),
            &telemetry(50.0),
            &settings(DessMode::Off, 80.0, false),
            &Caps::default(),
        );
        assert_eq!(out, neutral());
        assert_eq!(d.status(), Status::default());
        assert!(!d.is_running());

        assert!(!d.mode_changed(1, 2));
        assert!(d.mode_changed(0, 1));
        assert!(d.is_running());
        assert!(!d.mode_changed(0, 1));
    }

    #[test]
    fn preconditions() {
        let s = settings(DessMode::Auto, 80.0, false);
        let mut d = DynamicEss::new(1);

        let mut t = telemetry(50.0);
        t.soc = None;
        assert_eq!(d.tick(now(), &t, &s, &Caps::default()), neutral());
        assert_eq!(d.status().error, ErrorCode::SocLow);

        let caps = Caps { limit: None, ..Default::default() };
        d.tick(now(), &telemetry(50.0), &s, &caps);
        assert_eq!(d.status().error, ErrorCode::SocLow);

        let caps = Caps { ess: false, ..Default::default() };
        d.tick(now(), &telemetry(50.0), &s, &caps);
        assert_eq!(d.status().error, ErrorCode::NoEss);

        let mut no_capacity = s.clone();
        no_capacity.capacity = 0.0;
        d.tick(now(), &telemetry(50.0), &no_capacity, &Caps::default());
        assert_eq!(d.status().error, ErrorCode::CapacityUnset);

        let caps = Caps { state: ProtectionState::KeepCharged, ..Default::default() };
        d.tick(now(), &telemetry(50.0), &s, &caps);
        assert_eq!(d.status().error, ErrorCode::EssMode);

        let mut t = telemetry(50.0);
        t.hub4_mode = Some(HUB4_EXTERNAL_CONTROL);
        d.tick(now(), &t, &s, &Caps::default());
        assert_eq!(d.status().error, ErrorCode::EssMode);
        assert_eq!(d.status().active, DessMode::Off);
        assert!(d.is_running());
    }

    #[test]
    fn precondition_order() {
        let mut s = settings(DessMode::Auto, 80.0, false);
        s.capacity = 0.0;
        let caps = Caps { ess: false, limit: None, ..Default::default() };
        let mut d = DynamicEss::new(1);
        d.tick(now(), &telemetry(50.0), &s, &caps);
        assert_eq!(d.status().error, ErrorCode::SocLow);
    }

    #[test]
    fn buy() {
        let mut d = DynamicEss::new(2);
        let out = d.tick(
            now(),
            &telemetry(50.0),
            &settings(DessMode::Buy, 80.0, false),
            &Caps::default(),
        );
        assert_eq!(
            out,
            vec![
                Override::FeedInExcess(FeedInExcess::Normal),
                Override::ForceCharge(true),
                Override::Setpoint(None),
                Override::MaxChargePower(-1.0),
                Override::MaxDischargePower(-1.0),
            ]
        );
        assert_eq!(d.status().active, DessMode::Buy);
        assert_eq!(d.status().target_soc, None);
    }

    #[test]
    fn sell() {
        let mut d = DynamicEss::new(3);
        let out = d.tick(
            now(),
            &telemetry(50.0),
            &settings(DessMode::Sell, 80.0, false),
            &Caps::default(),
        );
        assert_eq!(
            out,
            vec![
                Override::FeedInExcess(FeedInExcess::Allowed),
                Override::ForceCharge(false),
                Override::Setpoint(Some(-5000.0)),
                Override::MaxDischargePower(-1.0),
            ]
        );
        assert_eq!(d.status().active, DessMode::Sell);
        assert_eq!(d.status().error, ErrorCode::None);
    }

    #[test]
    fn feed_in_power() {
        assert_eq!(max_feed_in_power(None), SELL_POWER);
        assert_eq!(max_feed_in_power(Some(-1.0)), SELL_POWER);
        assert_eq!(max_feed_in_power(Some(0.0)), 0.0);
        assert_eq!(max_feed_in_power(Some(4000.0)), -4000.0);
        assert_eq!(max_feed_in_power(Some(50000.0)), SELL_POWER);
    }

    #[test]
    fn charge_towards_target() {
        let mut d = DynamicEss::new(1);
        let out = d.tick(
            now(),
            &telemetry(75.0),
            &settings(DessMode::Auto, 80.0, false),
            &Caps::default(),
        );
        // 5% of 10kWh over the remaining hour is 500W, minus 100W of PV
        assert_eq!(
            out,
            vec![
                Override::FeedInExcess(FeedInExcess::Normal),
                Override::Setpoint(None),
                Override::ForceCharge(true),
                Override::MaxDischargePower(-1.0),
                Override::MaxChargePower(400.0),
            ]
        );
        assert_eq!(
            d.status(),
            Status {
                active: DessMode::Auto,
                error: ErrorCode::None,
                target_soc: Some(80.0),
            }
        );
    }

    #[test]
    fn charge_without_battery_import() {
        let mut s = settings(DessMode::Local, 80.0, false);
        s.restrictions = 2;
        let mut d = DynamicEss::new(4);
        let out = d.tick(now(), &telemetry(75.0), &s, &Caps::default());
        assert_eq!(out.last(), Some(&Override::MaxChargePower(75.0)));
        assert_eq!(d.status().active, DessMode::Auto);
    }

    #[test]
    fn charge_rate_is_cached() {
        let s = settings(DessMode::Auto, 80.0, false);
        let mut d = DynamicEss::new(1);
        d.tick(now(), &telemetry(75.0), &s, &Caps::default());
        let out = d.tick(now() + Duration::minutes(30), &telemetry(75.0), &s, &Caps::default());
        assert_eq!(out.last(), Some(&Override::MaxChargePower(400.0)));

        // 4% over 30 minutes
        let out = d.tick(now() + Duration::minutes(30), &telemetry(76.0), &s, &Caps::default());
        assert_eq!(out.last(), Some(&Override::MaxChargePower(700.0)));
    }

    #[test]
    fn discharge_towards_target() {
        let mut d = DynamicEss::new(1);
        let out = d.tick(
            now(),
            &telemetry(60.0),
            &settings(DessMode::Auto, 50.0, true),
            &Caps::default(),
        );
        // 10% of 10kWh over an hour plus PV
        assert_eq!(
            out,
            vec![
                Override::FeedInExcess(FeedInExcess::Allowed),
                Override::MaxChargePower(-1.0),
                Override::ForceCharge(false),
                Override::MaxDischargePower(1100.0),
                Override::Setpoint(Some(-5000.0)),
            ]
        );
    }

    #[test]
    fn discharge_without_battery_export() {
        let mut s = settings(DessMode::Auto, 50.0, false);
        s.restrictions = 1;
        let mut d = DynamicEss::new(1);
        let out = d.tick(now(), &telemetry(60.0), &s, &Caps::default());
        assert!(out.contains(&Override::MaxDischargePower(601.0)));
        assert_eq!(out.last(), Some(&Override::Setpoint(None)));
    }

    #[test]
    fn idle_respects_floor() {
        // target below the protection floor: stay idle at the floor
        let caps = Caps { limit: Some(60.0), ..Default::default() };
        let mut d = DynamicEss::new(1);
        let out = d.tick(now(), &telemetry(60.0), &settings(DessMode::Auto, 40.0, false), &caps);
        assert!(out.contains(&Override::MaxDischargePower(90.0)));

        let mut t = telemetry(60.0);
        t.dc_pv_power = None;
        let out = d.tick(now(), &t, &settings(DessMode::Auto, 40.0, false), &caps);
        assert!(out.contains(&Override::MaxDischargePower(1.0)));
    }

    #[test]
    fn hysteresis() {
        let s = settings(DessMode::Auto, 80.0, false);
        let mut d = DynamicEss::new(1);

        // at target: idle, charge hysteresis armed
        let out = d.tick(now(), &telemetry(80.0), &s, &Caps::default());
        assert!(out.contains(&Override::ForceCharge(false)));

        // 79.5 + 1 is not below 80, keep idling
        let out = d.tick(now(), &telemetry(79.5), &s, &Caps::default());
        assert!(out.contains(&Override::ForceCharge(false)));

        let out = d.tick(now(), &telemetry(78.9), &s, &Caps::default());
        assert!(out.contains(&Override::ForceCharge(true)));

        // after charging, 80.5 - 0 > 80 discharges straight away
        let out = d.tick(now(), &telemetry(80.5), &s, &Caps::default());
        assert!(out.contains(&Override::MaxDischargePower(150.0)));

        // discharge hysteresis only arms when idling
        let out = d.tick(now(), &telemetry(80.0), &s, &Caps::default());
        assert!(out.contains(&Override::MaxDischargePower(90.0)));
        let out = d.tick(now(), &telemetry(80.8), &s, &Caps::default());
        assert!(out.contains(&Override::MaxDischargePower(90.0)));
    }

    #[test]
    fn no_matching_window() {
        let s = settings(DessMode::Auto, 80.0, false);
        let mut d = DynamicEss::new(1);

        // never active: nothing to undo
        let out = d.tick(now() + Duration::hours(1), &telemetry(75.0), &s, &Caps::default());
        assert!(out.is_empty());
        assert_eq!(d.status().error, ErrorCode::None);

        d.tick(now(), &telemetry(75.0), &s, &Caps::default());
        let out = d.tick(now() + Duration::hours(1), &telemetry(75.0), &s, &Caps::default());
        assert_eq!(out, neutral());
        assert_eq!(d.status().error, ErrorCode::NoMatchingSchedule);
        assert_eq!(d.status().active, DessMode::Off);
        assert_eq!(d.status().target_soc, None);
    }

    #[test]
    fn first_matching_window_wins() {
        let mut s = settings(DessMode::Auto, 80.0, false);
        s.schedule[1] = ScheduleSetting {
            start: now().timestamp(),
            duration: 600,
            soc: 30.0,
            allow_feedin: true,
        };
        let mut d = DynamicEss::new(1);
        d.tick(now(), &telemetry(75.0), &s, &Caps::default());
        assert_eq!(d.status().target_soc, Some(80.0));

        s.schedule[0].duration = 3600;
        d.tick(now(), &telemetry(75.0), &s, &Caps::default());
        assert_eq!(d.status().target_soc, Some(30.0));
    }

    #[test]
    fn status_display() {
        let s = Status {
            active: DessMode::Auto,
            error: ErrorCode::None,
            target_soc: Some(80.0),
        };
        assert_eq!(s.to_string(), "Active: Auto, Error: No error (0), Target: 80%");
        assert_eq!(
            Status::default().to_string(),
            "Active: Off, Error: No error (0), Target: none"
        );
    }

    #[test]
    fn settings_sanitize() {
        let mut s = DynamicEssSettings {
            mode: 9,
            capacity: -2.0,
            efficiency: 140.0,
            restrictions: 3,
            ..Default::default()
        };
        s.sanitize();
        assert_eq!(s.mode, 4);
        assert_eq!(s.capacity, 0.0);
        assert_eq!(s.efficiency, 100.0);
        assert_eq!(s.restrictions, 2);
        assert!(s.battery_export());
        assert!(!s.battery_import());
    }
}
