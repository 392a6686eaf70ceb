use crate::battery_life::state::ProtectionState;
use crate::victron::VictronError;
use async_trait::async_trait;
use std::fmt::{Display, Formatter};

/// What the scheduler needs to know about battery protection.
pub trait EssCapabilities {
    fn protection_state(&self) -> ProtectionState;

    /// `None` until the protector has seen a valid SoC
    fn active_soc_limit(&self) -> Option<f64>;

    fn has_ess_capability(&self) -> bool;
}

/// Snapshot of the remote values the controller reads each poll.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Telemetry {
    pub soc: Option<f64>,
    pub vebus: bool,
    pub sustain: bool,
    pub ess_assistant: bool,
    pub ac_consumption: [Option<f64>; 3],
    pub dc_pv_power: Option<f64>,
    pub ac_pv_on_grid: [Option<f64>; 3],
    pub hub4_mode: Option<u16>,
    pub max_feed_in_power: Option<f64>,
}

impl Telemetry {
    pub fn pv_power(&self) -> f64 {
        self.dc_pv_power.unwrap_or(0.0)
    }

    pub fn consumption(&self) -> f64 {
        self.ac_consumption
            .iter()
            .map(|p| p.unwrap_or(0.0))
            .sum::<f64>()
            .max(0.0)
    }

    pub fn ac_pv(&self) -> f64 {
        self.ac_pv_on_grid.iter().map(|p| p.unwrap_or(0.0)).sum()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FeedInExcess {
    Off = 0,
    Normal = 1,
    Allowed = 2,
}

/// A single value written to the inverter control surface.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Override {
    ForceCharge(bool),
    /// Watts, -1 is unrestricted
    MaxChargePower(f64),
    /// Watts, -1 is unrestricted
    MaxDischargePower(f64),
    /// Grid setpoint in watts, `None` for normal ESS behaviour
    Setpoint(Option<f64>),
    FeedInExcess(FeedInExcess),
}

impl Display for Override {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Override::ForceCharge(v) => write!(f, "ForceCharge={}", v),
            Override::MaxChargePower(v) => write!(f, "MaxChargePower={}", v),
            Override::MaxDischargePower(v) => write!(f, "MaxDischargePower={}", v),
            Override::Setpoint(Some(v)) => write!(f, "Setpoint={}", v),
            Override::Setpoint(None) => write!(f, "Setpoint=none"),
            Override::FeedInExcess(v) => write!(f, "FeedInExcess={}", *v as u8),
        }
    }
}

#[async_trait]
pub trait TelemetrySource {
    async fn read(&mut self) -> Result<Telemetry, VictronError>;
}

#[async_trait]
pub trait OverrideSink {
    async fn write(&mut self, value: Override) -> Result<(), VictronError>;
}
