use crate::victron::client::VictronClient;
use crate::victron::{Line, VictronError};
use std::net::SocketAddr;

/// The GX system service, which also exposes the ESS settings.
pub struct VictronSystem {
    client: VictronClient,
}

pub enum Register {
    ConsumptionPower(Line),
    PvOnGridPower(Line),
    BatterySoc,
    DcPvPower,
    /// Watts / 100
    MaxFeedInPower,
    Hub4Mode,
}

impl VictronSystem {
    pub async fn new(addr: SocketAddr, unit: u8) -> Result<Self, VictronError> {
        let mut cli = VictronClient::new(addr).await?;
        cli.set_unit(unit);
        Ok(Self { client: cli })
    }

    pub async fn soc(&mut self) -> Result<f64, VictronError> {
        Ok(self.get(Register::BatterySoc).await? as f64)
    }

    pub async fn dc_pv_power(&mut self) -> Result<f64, VictronError> {
        Ok(self.get(Register::DcPvPower).await? as f64)
    }

    pub async fn consumption(&mut self, line: Line) -> Result<f64, VictronError> {
        Ok(self.get(Register::ConsumptionPower(line)).await? as f64)
    }

    pub async fn pv_on_grid(&mut self, line: Line) -> Result<f64, VictronError> {
        Ok(self.get(Register::PvOnGridPower(line)).await? as f64)
    }

    pub async fn hub4_mode(&mut self) -> Result<u16, VictronError> {
        self.get(Register::Hub4Mode).await
    }

    /// Configured feed-in limit in watts, negative when unlimited.
    pub async fn max_feed_in_power(&mut self) -> Result<f64, VictronError> {
        let v = self.client.read_i16(Self::get_register(Register::MaxFeedInPower)).await?;
        Ok(v as f64 * 100.0)
    }

    pub async fn get(&mut self, reg: Register) -> Result<u16, VictronError> {
        self.client.read_u16(Self::get_register(reg)).await
    }

    fn get_register(reg: Register) -> u16 {
        use Register::*;
        match reg {
            PvOnGridPower(l) => 810 + l as u16,
            ConsumptionPower(l) => 816 + l as u16,
            BatterySoc => 843,
            DcPvPower => 850,
            MaxFeedInPower => 2706,
            Hub4Mode => 2902,
        }
    }
}
