use crate::port::{Override, OverrideSink};
use crate::victron::client::VictronClient;
use crate::victron::VictronError;
use async_trait::async_trait;
use std::net::SocketAddr;

/// Register value meaning "no restriction" for the power limits
pub const POWER_UNRESTRICTED: u16 = u16::MAX;
/// Register value meaning "no setpoint override"
pub const SETPOINT_NONE: i16 = i16::MIN;

/// Hub4 override registers of the ESS control loop.
pub struct VictronESS {
    client: VictronClient,
    base: u16,
}

impl VictronESS {
    /// `base` is the first register of the override block.
    pub async fn new(addr: SocketAddr, unit: u8, base: u16) -> Result<Self, VictronError> {
        let mut cli = VictronClient::new(addr).await?;
        cli.set_unit(unit);
        Ok(Self { client: cli, base })
    }

    fn map_register(&self, o: &Override) -> u16 {
        self.base
            + match o {
                Override::ForceCharge(_) => 0,
                Override::MaxChargePower(_) => 1,
                Override::MaxDischargePower(_) => 2,
                Override::Setpoint(_) => 3,
                Override::FeedInExcess(_) => 4,
            }
    }
}

/// Watts, negative values lift the restriction.
fn encode_power(watts: f64) -> u16 {
    if watts < 0.0 {
        return POWER_UNRESTRICTED;
    }
    watts.round().min((POWER_UNRESTRICTED - 1) as f64) as u16
}

fn encode_setpoint(watts: Option<f64>) -> i16 {
    match watts {
        Some(w) => w.round().clamp((SETPOINT_NONE + 1) as f64, i16::MAX as f64) as i16,
        None => SETPOINT_NONE,
    }
}

#[async_trait]
impl OverrideSink for VictronESS {
    async fn write(&mut self, value: Override) -> Result<(), VictronError> {
        let addr = self.map_register(&value);
        match value {
            Override::ForceCharge(v) => self.client.write_u16(addr, if v { 1 } else { 0 }).await,
            Override::MaxChargePower(w) | Override::MaxDischargePower(w) => {
                self.client.write_u16(addr, encode_power(w)).await
            }
            Override::Setpoint(w) => self.client.write_i16(addr, encode_setpoint(w)).await,
            Override::FeedInExcess(m) => self.client.write_u16(addr, m as u16).await,
        }
    }
}
