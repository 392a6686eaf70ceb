use crate::victron::client::VictronClient;
use crate::victron::VictronError;
use std::net::SocketAddr;

/// The inverter/charger on the VE.Bus.
pub struct VictronBus {
    client: VictronClient,
}

pub enum Register {
    State,
    Hub4Sustain,
    Hub4AssistantId,
}

impl VictronBus {
    pub async fn new(addr: SocketAddr, unit: u8) -> Result<Self, VictronError> {
        let mut cli = VictronClient::new(addr).await?;
        cli.set_unit(unit);
        Ok(Self { client: cli })
    }

    /// The state register only answers while an inverter is on the bus.
    pub async fn present(&mut self) -> Result<bool, VictronError> {
        self.get(Register::State).await.map(|_| true)
    }

    pub async fn sustain(&mut self) -> Result<bool, VictronError> {
        self.client.read_bool(Self::get_register(Register::Hub4Sustain)).await
    }

    /// The assistant id is only published when an ESS assistant is loaded.
    pub async fn ess_assistant(&mut self) -> Result<bool, VictronError> {
        self.get(Register::Hub4AssistantId).await.map(|_| true)
    }

    pub async fn get(&mut self, reg: Register) -> Result<u16, VictronError> {
        self.client.read_u16(Self::get_register(reg)).await
    }

    fn get_register(reg: Register) -> u16 {
        match reg {
            Register::State => 31,
            Register::Hub4Sustain => 73,
            Register::Hub4AssistantId => 74,
        }
    }
}
