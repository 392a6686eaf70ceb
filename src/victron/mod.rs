use crate::port::{Telemetry, TelemetrySource};
use async_trait::async_trait;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::debug;

pub mod client;
pub mod ess;
pub mod system;
pub mod ve_bus;

use system::VictronSystem;
use ve_bus::VictronBus;

#[derive(Debug, Error)]
pub enum VictronError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("modbus transport error: {0}")]
    Transport(String),

    #[error("modbus exception: {0}")]
    Exception(String),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Line {
    L1 = 1,
    L2 = 2,
    L3 = 3,
}

impl Line {
    pub const ALL: [Line; 3] = [Line::L1, Line::L2, Line::L3];
}

/// Telemetry from a GX device: the system service and the inverter.
pub struct VictronGx {
    system: VictronSystem,
    bus: VictronBus,
}

impl VictronGx {
    pub async fn connect(
        addr: SocketAddr,
        system_unit: u8,
        vebus_unit: u8,
    ) -> Result<Self, VictronError> {
        Ok(Self {
            system: VictronSystem::new(addr, system_unit).await?,
            bus: VictronBus::new(addr, vebus_unit).await?,
        })
    }
}

fn ok_or_log<T>(name: &str, r: Result<T, VictronError>) -> Option<T> {
    match r {
        Ok(v) => Some(v),
        Err(e) => {
            debug!("{} unavailable: {}", name, e);
            None
        }
    }
}

#[async_trait]
impl TelemetrySource for VictronGx {
    async fn read(&mut self) -> Result<Telemetry, VictronError> {
        let mut t = Telemetry {
            soc: ok_or_log("SoC", self.system.soc().await),
            dc_pv_power: ok_or_log("DC PV power", self.system.dc_pv_power().await),
            hub4_mode: ok_or_log("Hub4 mode", self.system.hub4_mode().await),
            max_feed_in_power: ok_or_log("max feed-in", self.system.max_feed_in_power().await),
            ..Default::default()
        };
        for (i, line) in Line::ALL.into_iter().enumerate() {
            t.ac_consumption[i] = ok_or_log("AC consumption", self.system.consumption(line).await);
            t.ac_pv_on_grid[i] = ok_or_log("AC PV", self.system.pv_on_grid(line).await);
        }

        // A missing inverter is a normal condition, not a read failure
        t.vebus = ok_or_log("VE.Bus state", self.bus.present().await).unwrap_or(false);
        if t.vebus {
            t.sustain = ok_or_log("sustain", self.bus.sustain().await).unwrap_or(false);
            t.ess_assistant =
                ok_or_log("ESS assistant", self.bus.ess_assistant().await).unwrap_or(false);
        }
        Ok(t)
    }
}
