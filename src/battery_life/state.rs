use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::{BitOr, BitOrAssign};

pub const SOC_SWITCH_OFFSET: f64 = 3.0;
pub const SOC_SWITCH_INCREMENT: f64 = 5.0;
/// Should be < SOC_SWITCH_OFFSET
pub const LOW_SOC_CHARGE_OFFSET: f64 = 2.0;
pub const ABSORPTION_LEVEL: f64 = 85.0;
pub const FLOAT_LEVEL: f64 = 95.0;
pub const SOC_SWITCH_MAX: f64 = ABSORPTION_LEVEL - SOC_SWITCH_INCREMENT;

/// Battery protection phase, persisted as its integer value.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(from = "u8", into = "u8")]
pub enum ProtectionState {
    Disabled = 0,
    Restart = 1,
    Default = 2,
    Absorption = 3,
    Float = 4,
    Discharged = 5,
    ForceCharge = 6,
    Sustain = 7,
    /// No longer produced, only accepted from persisted settings
    LowSocCharge = 8,
    KeepCharged = 9,
    SocGuardDefault = 10,
    SocGuardDischarged = 11,
    /// No longer produced, only accepted from persisted settings
    SocGuardLowSocCharge = 12,
}

impl From<u8> for ProtectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ProtectionState::Disabled,
            1 => ProtectionState::Restart,
            2 => ProtectionState::Default,
            3 => ProtectionState::Absorption,
            4 => ProtectionState::Float,
            5 => ProtectionState::Discharged,
            6 => ProtectionState::ForceCharge,
            7 => ProtectionState::Sustain,
            8 => ProtectionState::LowSocCharge,
            9 => ProtectionState::KeepCharged,
            10 => ProtectionState::SocGuardDefault,
            11 => ProtectionState::SocGuardDischarged,
            12 => ProtectionState::SocGuardLowSocCharge,
            e => {
                tracing::warn!("Unknown protection state {}, falling back to Default", e);
                ProtectionState::Default
            }
        }
    }
}

impl From<ProtectionState> for u8 {
    fn from(s: ProtectionState) -> Self {
        s as u8
    }
}

impl Display for ProtectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProtectionState::Disabled => "Disabled",
            ProtectionState::Restart => "Restart",
            ProtectionState::Default => "Default",
            ProtectionState::Absorption => "Absorption",
            ProtectionState::Float => "Float",
            ProtectionState::Discharged => "Discharged",
            ProtectionState::ForceCharge => "Force Charge",
            ProtectionState::Sustain => "Sustain",
            ProtectionState::LowSocCharge => "Low SoC Charge",
            ProtectionState::KeepCharged => "Keep Charged",
            ProtectionState::SocGuardDefault => "SoC Guard",
            ProtectionState::SocGuardDischarged => "SoC Guard Discharged",
            ProtectionState::SocGuardLowSocCharge => "SoC Guard Low SoC Charge",
        };
        write!(f, "{}", s)
    }
}

/// One-time SoC limit adjustments already applied in the current cycle.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct ProtectionFlags(u8);

impl ProtectionFlags {
    pub const FLOAT: ProtectionFlags = ProtectionFlags(0x01);
    pub const ABSORPTION: ProtectionFlags = ProtectionFlags(0x02);
    pub const DISCHARGED: ProtectionFlags = ProtectionFlags(0x04);

    pub const fn empty() -> Self {
        ProtectionFlags(0)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: ProtectionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ProtectionFlags) {
        self.0 |= other.0
    }

    pub fn clear(&mut self) {
        self.0 = 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ProtectionFlags {
    type Output = ProtectionFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        ProtectionFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ProtectionFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs)
    }
}

impl From<u8> for ProtectionFlags {
    fn from(v: u8) -> Self {
        ProtectionFlags(v & 0x07)
    }
}

/// Outcome of evaluating the transition table for one telemetry update.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transition {
    To(ProtectionState),
    Stay,
}

/// Whether entering a phase may touch the SoC limit and flags.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Adjust {
    Apply,
    /// Used while restarting; phases are detected without side effects
    Suppress,
}

impl Adjust {
    pub fn applies(&self) -> bool {
        *self == Adjust::Apply
    }
}
