use crate::victron::VictronError;
use std::net::SocketAddr;
use tokio_modbus::client::{tcp, Context, Reader, Writer};
use tokio_modbus::slave::{Slave, SlaveContext};

pub(crate) struct VictronClient {
    client: Context,
}

impl VictronClient {
    pub async fn new(addr: SocketAddr) -> Result<Self, VictronError> {
        let ctx = tcp::connect(addr).await?;
        Ok(Self { client: ctx })
    }

    pub fn set_unit(&mut self, unit: u8) {
        self.client.set_slave(Slave(unit))
    }

    pub async fn write_i16(&mut self, addr: u16, value: i16) -> Result<(), VictronError> {
        self.write_u16(addr, value as u16).await
    }

    pub async fn write_u16(&mut self, addr: u16, value: u16) -> Result<(), VictronError> {
        self.client
            .write_single_register(addr, value)
            .await
            .map_err(|e| VictronError::Transport(e.to_string()))?
            .map_err(|e| VictronError::Exception(e.to_string()))
    }

    pub async fn read_bool(&mut self, addr: u16) -> Result<bool, VictronError> {
        Ok(match self.read_u16(addr).await? {
            0 => false,
            1 => true,
            e => return Err(VictronError::Invalid(format!("Unknown bool state {}!", e))),
        })
    }

    pub async fn read_i16(&mut self, addr: u16) -> Result<i16, VictronError> {
        Ok(self.read_u16(addr).await? as i16)
    }

    pub async fn read_u16(&mut self, addr: u16) -> Result<u16, VictronError> {
        let v = self
            .client
            .read_holding_registers(addr, 1)
            .await
            .map_err(|e| VictronError::Transport(e.to_string()))?
            .map_err(|e| VictronError::Exception(e.to_string()))?;
        v.first()
            .copied()
            .ok_or_else(|| VictronError::Invalid(format!("Empty response for register {}", addr)))
    }
}
